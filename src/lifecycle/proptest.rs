//! Property-Based Tests for Lifecycle Documents
//!
//! # Test Properties
//!
//! 1. **Marshal Identity**: parsing a marshalled valid document yields it back
//! 2. **Stable Rejection**: an invalid document is rejected with the same
//!    code after marshalling and re-parsing
//! 3. **No Downgrade**: a transition never targets a class no heavier than
//!    the object's own

#![cfg(test)]

use std::collections::BTreeMap;

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;

use super::evaluate::{compute_action, Action, EvalContext, ObjectFacts};
use super::model::{
    AbortIncompleteMultipartUpload, And, Expiration, Filter, Lifecycle, NoncurrentVersionExpiration,
    NoncurrentVersionTransition, Rule, RuleStatus, Tag, Transition,
};
use crate::meta::StorageClass;

// =============================================================================
// Strategies
// =============================================================================

fn token() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9/_.-]{1,16}"
}

fn class() -> impl Strategy<Value = String> {
    prop::sample::select(StorageClass::ALL.to_vec()).prop_map(|c| c.name().to_string())
}

/// Midnight UTC dates between 2020 and 2030.
fn date() -> impl Strategy<Value = String> {
    (0i64..3650).prop_map(|d| {
        let base = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        (base + Duration::days(d))
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string()
    })
}

fn filter() -> impl Strategy<Value = Option<Filter>> {
    prop_oneof![
        Just(None),
        token().prop_map(|prefix| Some(Filter {
            prefix: Some(prefix),
            ..Default::default()
        })),
        (token(), token()).prop_map(|(key, value)| Some(Filter {
            tag: Some(Tag { key, value }),
            ..Default::default()
        })),
        (
            prop::option::of(token()),
            prop::collection::btree_map(token(), token(), 1..4)
        )
            .prop_map(|(prefix, tags)| Some(Filter {
                and: Some(And {
                    prefix,
                    tags: tags.into_iter().map(|(key, value)| Tag { key, value }).collect(),
                }),
                ..Default::default()
            })),
    ]
}

fn expiration() -> impl Strategy<Value = Option<Expiration>> {
    prop_oneof![
        Just(None),
        (1i64..1000).prop_map(|days| Some(Expiration {
            days: Some(days),
            ..Default::default()
        })),
        date().prop_map(|date| Some(Expiration {
            date: Some(date),
            ..Default::default()
        })),
        Just(Some(Expiration {
            expired_object_delete_marker: Some(true),
            ..Default::default()
        })),
    ]
}

fn transition() -> impl Strategy<Value = Transition> {
    prop_oneof![
        (1i64..1000, class()).prop_map(|(days, storage_class)| Transition {
            days: Some(days),
            date: None,
            storage_class: Some(storage_class),
        }),
        (date(), class()).prop_map(|(date, storage_class)| Transition {
            days: None,
            date: Some(date),
            storage_class: Some(storage_class),
        }),
    ]
}

fn rule() -> impl Strategy<Value = Rule> {
    (
        prop::option::of(token()),
        any::<bool>(),
        filter(),
        expiration(),
        prop::collection::vec(transition(), 0..3),
        prop::option::of(1i64..1000),
        prop::collection::vec((1i64..1000, class()), 0..2),
        prop::option::of(1i64..100),
    )
        .prop_map(
            |(id, enabled, filter, expiration, transitions, nc_days, nc_transitions, abort)| {
                let mut rule = Rule {
                    id,
                    status: if enabled {
                        RuleStatus::Enabled
                    } else {
                        RuleStatus::Disabled
                    },
                    filter,
                    expiration,
                    transitions,
                    noncurrent_version_expiration: nc_days.map(|d| NoncurrentVersionExpiration {
                        noncurrent_days: Some(d),
                    }),
                    noncurrent_version_transitions: nc_transitions
                        .into_iter()
                        .map(|(d, c)| NoncurrentVersionTransition {
                            noncurrent_days: Some(d),
                            storage_class: Some(c),
                        })
                        .collect(),
                    abort_incomplete_multipart_upload: abort.map(|d| {
                        AbortIncompleteMultipartUpload {
                            days_after_initiation: Some(d),
                        }
                    }),
                };
                // Tag filters exclude marker expiration and multipart aborts.
                if !rule.tags().is_empty() {
                    if rule.expiration.as_ref().map(|e| e.delete_marker()).unwrap_or(false) {
                        rule.expiration = Some(Expiration {
                            days: Some(1),
                            ..Default::default()
                        });
                    }
                    rule.abort_incomplete_multipart_upload = None;
                }
                if rule.expiration.is_none()
                    && rule.transitions.is_empty()
                    && rule.noncurrent_version_expiration.is_none()
                    && rule.noncurrent_version_transitions.is_empty()
                    && rule.abort_incomplete_multipart_upload.is_none()
                {
                    rule.expiration = Some(Expiration {
                        days: Some(1),
                        ..Default::default()
                    });
                }
                rule
            },
        )
}

fn lifecycle() -> impl Strategy<Value = Lifecycle> {
    prop::collection::vec(rule(), 1..=100).prop_map(|rules| Lifecycle { xmlns: None, rules })
}

/// Break rule `index` in one of several ways.
fn corrupt(lc: &mut Lifecycle, index: usize, how: u8) {
    let index = index % lc.rules.len();
    let rule = &mut lc.rules[index];
    match how % 4 {
        0 => rule.status = RuleStatus::Invalid("Paused".to_string()),
        1 => {
            rule.expiration = Some(Expiration {
                days: Some(-3),
                ..Default::default()
            })
        }
        2 => rule.transitions.push(Transition {
            days: Some(1),
            date: None,
            storage_class: Some("COLD".to_string()),
        }),
        _ => {
            rule.filter = Some(Filter {
                prefix: Some("a".to_string()),
                tag: Some(Tag {
                    key: "k".to_string(),
                    value: "v".to_string(),
                }),
                and: None,
            })
        }
    }
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_marshal_parse_identity(lc in lifecycle()) {
        prop_assert!(lc.validate().is_ok());
        let xml = lc.to_xml().unwrap();
        let parsed = Lifecycle::parse(&xml).unwrap();
        prop_assert_eq!(parsed, lc);
    }

    #[test]
    fn prop_rejection_survives_marshalling(
        mut lc in lifecycle(),
        index in any::<usize>(),
        how in any::<u8>(),
    ) {
        corrupt(&mut lc, index, how);
        let rejected = lc.validate().unwrap_err().api_code();
        prop_assert!(rejected.is_some());
        let reparsed = Lifecycle::parse(&lc.to_xml().unwrap()).unwrap_err().api_code();
        prop_assert_eq!(reparsed, rejected);
    }

    #[test]
    fn prop_transition_never_downgrades(
        lc in lifecycle(),
        class_index in 0usize..StorageClass::ALL.len(),
        age_days in 0i64..5000,
    ) {
        let now = Utc::now();
        let ctx = EvalContext::new(now, false);
        let object_class = StorageClass::ALL[class_index];
        let tags = BTreeMap::new();
        let facts = ObjectFacts {
            name: "some/key",
            tags: &tags,
            storage_class: object_class,
            mod_time: now - Duration::days(age_days),
            lone_delete_marker: false,
        };
        let (action, target) = compute_action(&ctx, &facts, &lc.filter_rules().current);
        if action == Action::Transition {
            let target = target.unwrap();
            prop_assert!(target.weight() > object_class.weight());
        } else {
            prop_assert!(target.is_none());
        }
    }
}

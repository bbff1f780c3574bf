#![cfg(test)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use maplit::hashmap;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::big_segments::{
    BigSegmentProvider, BigSegmentStore, BigSegmentsStatus, Membership, StoreMetadata,
};
use crate::error::StoreError;
use crate::flag::Flag;
use crate::segment::Segment;
use crate::store::Store;
use crate::util::hash_context_key;
use crate::PrerequisiteEvent;
use crate::PrerequisiteEventRecorder;

pub struct TestStore {
    flags: HashMap<String, Flag>,
    segments: HashMap<String, Segment>,
}

// A boolean flag with variations [false, true] that is on, falls through to true and has no
// targeting. `extra` overrides any of those fields.
fn boolean_flag(key: &str, extra: Value) -> Flag {
    let mut definition = json!({
        "key": key,
        "version": 42,
        "on": true,
        "targets": [],
        "rules": [],
        "prerequisites": [],
        "fallthrough": {"variation": 1},
        "offVariation": 0,
        "variations": [false, true],
        "salt": "salty"
    });
    if let (Some(target), Some(extra)) = (definition.as_object_mut(), extra.as_object()) {
        target.extend(extra.clone());
    }
    serde_json::from_value(definition).unwrap()
}

fn key_rule(id: &str, variation: Value, attribute: &str) -> Value {
    json!({
        "id": id,
        "clauses": [{"attribute": attribute, "op": "in", "values": ["yes"]}],
        "variation": variation,
    })
}

fn segment_rule(id: &str, segments: &[&str]) -> Value {
    json!({
        "id": id,
        "clauses": [{"attribute": "key", "op": "segmentMatch", "values": segments}],
        "variation": 1,
    })
}

fn prerequisites(prereqs: &[(&str, i64)]) -> Value {
    prereqs
        .iter()
        .map(|(key, variation)| json!({"key": key, "variation": variation}))
        .collect()
}

impl TestStore {
    pub fn new() -> Self {
        let flags = vec![
            boolean_flag("flag", json!({"on": false})),
            boolean_flag(
                "flagWithTrackedRule",
                json!({
                    "on": false,
                    "rules": [{
                        "variation": 0,
                        "id": "6a7755ac-e47a-40ea-9579-a09dd5f061bd",
                        "clauses": [{"attribute": "platform", "op": "in", "values": ["web", "aem", "ios"]}],
                        "trackEvents": true
                    }],
                    "trackEventsFallthrough": true,
                    "debugEventsUntilDate": 1500000000u64
                }),
            ),
            boolean_flag(
                "flagWithTarget",
                json!({"on": false, "targets": [{"values": ["bob"], "variation": 0}]}),
            ),
            boolean_flag(
                "flagWithContextTarget",
                json!({
                    "targets": [{"values": ["bob"], "variation": 1}],
                    "contextTargets": [
                        {"contextKind": "org", "values": ["Acme"], "variation": 0},
                        {"contextKind": "user", "values": [], "variation": 1}
                    ],
                    "fallthrough": {"variation": 0}
                }),
            ),
            boolean_flag(
                "flagWithInRule",
                json!({
                    "on": false,
                    "rules": [{
                        "id": "in-rule",
                        "clauses": [{"attribute": "team", "op": "in", "values": ["Avengers"]}],
                        "variation": 0
                    }]
                }),
            ),
            boolean_flag(
                "flagWithEmailRule",
                json!({
                    "rules": [{
                        "id": "email-rule",
                        "clauses": [{"attribute": "email", "op": "in", "values": ["a@b.com"]}],
                        "variation": 1
                    }],
                    "fallthrough": {"variation": 0}
                }),
            ),
            serde_json::from_value(json!({
                "key": "flagWithTwoRules",
                "on": true,
                "rules": [
                    {
                        "id": "team-rule",
                        "clauses": [{"attribute": "team", "op": "in", "values": ["Avengers"]}],
                        "variation": 1
                    },
                    {
                        "id": "country-rule",
                        "clauses": [{"attribute": "country", "op": "in", "values": ["nz"]}],
                        "variation": 2
                    }
                ],
                "fallthrough": {"variation": 0},
                "variations": ["none", "team", "country"],
                "salt": "salty"
            }))
            .unwrap(),
            boolean_flag(
                "flagWithMissingPrereq",
                json!({"prerequisites": prerequisites(&[("badPrereq", 1)])}),
            ),
            boolean_flag(
                "flagWithOffPrereq",
                json!({"prerequisites": prerequisites(&[("offPrereq", 1)])}),
            ),
            boolean_flag(
                "flagWithOffPrereqFirst",
                json!({"prerequisites": prerequisites(&[("offPrereq", 1), ("prereq", 1)])}),
            ),
            boolean_flag(
                "flagWithMalformedPrereq",
                json!({"prerequisites": prerequisites(&[("flagWithOutOfRangeFallthrough", 1)])}),
            ),
            boolean_flag(
                "flagWithSatisfiedPrereq",
                json!({"prerequisites": prerequisites(&[("prereq", 1)])}),
            ),
            boolean_flag(
                "flagWithNestedPrereq",
                json!({"prerequisites": prerequisites(&[("flagWithSatisfiedPrereq", 1)])}),
            ),
            boolean_flag(
                "flagWithFirstPrereqAsPrereqToSecondPrereq",
                json!({
                    "prerequisites": prerequisites(&[("prereq", 1), ("flagWithSatisfiedPrereq", 1)])
                }),
            ),
            boolean_flag(
                "prereq",
                json!({"targets": [{"values": ["bob"], "variation": 0}]}),
            ),
            boolean_flag("offPrereq", json!({"on": false, "offVariation": 1})),
            boolean_flag(
                "flagWithSegmentMatchRule",
                json!({
                    "rules": [{
                        "id": "match-rule",
                        "clauses": [{
                            "contextKind": "user",
                            "attribute": "key",
                            "op": "segmentMatch",
                            "values": ["segment"]
                        }],
                        "variation": 1
                    }],
                    "fallthrough": {"variation": 0}
                }),
            ),
            boolean_flag(
                "flagWithBigSegmentRule",
                json!({
                    "rules": [segment_rule("big-rule", &["bigSegment"])],
                    "fallthrough": {"variation": 0}
                }),
            ),
            boolean_flag(
                "flagWithTwoBigSegmentRules",
                json!({
                    "rules": [
                        segment_rule("no-generation-rule", &["bigNoGeneration"]),
                        segment_rule("big-rule", &["bigSegment"])
                    ],
                    "fallthrough": {"variation": 0}
                }),
            ),
            boolean_flag(
                "flagWithBigSegmentPrereq",
                json!({"prerequisites": prerequisites(&[("flagWithBigSegmentRule", 1)])}),
            ),
            boolean_flag(
                "flagWithMalformedRule",
                json!({
                    "on": false,
                    "rules": [{
                        "id": "in-rule",
                        "clauses": [{"attribute": "key", "op": "in", "values": ["yes"]}]
                    }]
                }),
            ),
            boolean_flag(
                "flagWithOutOfRangeRule",
                json!({"rules": [key_rule("out-of-range", json!(5), "key")]}),
            ),
            boolean_flag(
                "flagWithNegativeRuleVariation",
                json!({"rules": [key_rule("negative", json!(-1), "key")]}),
            ),
            boolean_flag(
                "flagWithInvalidClauseReference",
                json!({"rules": [key_rule("bad-reference", json!(1), "")]}),
            ),
            boolean_flag(
                "flagWithOutOfRangeFallthrough",
                json!({"fallthrough": {"variation": 2}}),
            ),
            boolean_flag(
                "flagWithOutOfRangeTarget",
                json!({"targets": [{"values": ["yes"], "variation": 9}]}),
            ),
            boolean_flag(
                "flagWithEmptyRollout",
                json!({"fallthrough": {"rollout": {"variations": []}}}),
            ),
            boolean_flag(
                "flagWithExperiment",
                json!({
                    "fallthrough": {
                        "rollout": {
                            "kind": "experiment",
                            "seed": 61,
                            "variations": [
                                {"variation": 0, "weight": 10000, "untracked": false},
                                {"variation": 1, "weight": 20000, "untracked": false},
                                {"variation": 0, "weight": 70000, "untracked": true}
                            ]
                        }
                    }
                }),
            ),
            boolean_flag(
                "flagWithExperimentTargetingContext",
                json!({
                    "fallthrough": {
                        "rollout": {
                            "kind": "experiment",
                            "contextKind": "org",
                            "seed": 61,
                            "variations": [
                                {"variation": 0, "weight": 10000, "untracked": false},
                                {"variation": 1, "weight": 20000, "untracked": false},
                                {"variation": 0, "weight": 70000, "untracked": true}
                            ]
                        }
                    }
                }),
            ),
            serde_json::from_str(
                r#"{
                    "key": "rollout",
                    "on": true,
                    "rules": [{
                        "rollout": {
                            "variations": [
                                {"variation": 0, "weight": 50000},
                                {"variation": 1, "weight": 50000},
                                {"variation": 2, "weight": 0}
                            ],
                            "bucketBy": "ld_quid"
                        },
                        "id": "6a7755ac-e47a-40ea-9579-a09dd5f061bd",
                        "clauses": [{
                            "attribute": "platform",
                            "op": "in",
                            "values": ["web", "aem", "ios"],
                            "negate": false
                        }],
                        "trackEvents": false
                    }],
                    "fallthrough": {"variation": 2},
                    "offVariation": 1,
                    "variations": ["rollout1", "rollout2", "rollout3"],
                    "salt": "ce2634f116d741a7ad1b7ef363f6f9bc",
                    "debugEventsUntilDate": null,
                    "version": 7
                }"#,
            )
            .unwrap(),
        ];

        let mut flags: HashMap<String, Flag> = flags
            .into_iter()
            .map(|flag| (flag.key.clone(), flag))
            .collect();
        // bucketing depends on the flag key, so this one is stored under a different name
        if let Some(rollout) = flags.remove("rollout") {
            flags.insert("flagWithRolloutBucketBy".to_string(), rollout);
        }

        Self {
            flags,
            segments: hashmap! {
                "segment".to_string() => serde_json::from_str(r#"{
                        "key": "segment",
                        "included": ["alice"],
                        "includedContexts": [{
                            "values": [],
                            "contextKind": "user"
                        }],
                        "excluded": [],
                        "rules": [],
                        "salt": "salty",
                        "version": 1
                    }"#).unwrap(),
                "bigSegment".to_string() => serde_json::from_str(r#"{
                        "key": "bigSegment",
                        "unbounded": true,
                        "generation": 1,
                        "salt": "salty",
                        "version": 1
                    }"#).unwrap(),
                "bigNoGeneration".to_string() => serde_json::from_str(r#"{
                        "key": "bigNoGeneration",
                        "unbounded": true,
                        "salt": "salty",
                        "version": 1
                    }"#).unwrap(),
            },
        }
    }

    pub fn new_from_json_str(flag_json: &str, segment_json: &str) -> Self {
        let flags = serde_json::from_str(flag_json).unwrap();
        let segments = serde_json::from_str(segment_json).unwrap();

        Self { flags, segments }
    }

    pub fn update_flag(&mut self, flag_key: &str, fun: fn(&mut Flag)) {
        let flag = self.flags.get_mut(flag_key).unwrap();
        fun(flag);
    }
}

impl Store for TestStore {
    fn flag(&self, flag_key: &str) -> Option<Flag> {
        self.flags.get(flag_key).cloned()
    }

    fn segment(&self, segment_key: &str) -> Option<Segment> {
        self.segments.get(segment_key).cloned()
    }
}

pub struct InMemoryPrerequisiteEventRecorder {
    pub events: RefCell<Vec<PrerequisiteEvent>>,
}

impl InMemoryPrerequisiteEventRecorder {
    pub fn new() -> Self {
        Self {
            events: RefCell::new(Vec::new()),
        }
    }
}

impl PrerequisiteEventRecorder for InMemoryPrerequisiteEventRecorder {
    fn record(&self, event: PrerequisiteEvent) {
        self.events.borrow_mut().push(event);
    }
}

/// Answers every membership query with the same result and remembers who asked.
pub struct FixedBigSegmentProvider {
    membership: Option<Arc<Membership>>,
    status: BigSegmentsStatus,
    queried: Mutex<Vec<String>>,
}

impl FixedBigSegmentProvider {
    pub fn new(membership: Option<Membership>, status: BigSegmentsStatus) -> Self {
        Self {
            membership: membership.map(Arc::new),
            status,
            queried: Mutex::new(Vec::new()),
        }
    }

    /// A healthy provider that includes every context in `segment_refs`.
    pub fn included(segment_refs: &[&str]) -> Self {
        Self::new(
            Some(Membership::from_segment_refs(
                segment_refs.iter().copied(),
                Vec::<String>::new(),
            )),
            BigSegmentsStatus::Healthy,
        )
    }

    pub fn calls(&self) -> usize {
        self.queried.lock().len()
    }

    pub fn queried_keys(&self) -> Vec<String> {
        self.queried.lock().clone()
    }
}

impl BigSegmentProvider for FixedBigSegmentProvider {
    fn membership(&self, context_key: &str) -> (Option<Arc<Membership>>, BigSegmentsStatus) {
        self.queried.lock().push(context_key.to_string());
        (self.membership.clone(), self.status)
    }
}

struct MockState {
    memberships: HashMap<String, Membership>,
    metadata_age: Option<Duration>,
    metadata_error: bool,
    membership_error: bool,
    membership_delay: Duration,
    queried_hashes: Vec<String>,
}

/// An in-memory [BigSegmentStore] whose answers and failures tests can change while it is in
/// use.
pub struct MockBigSegmentStore {
    state: Mutex<MockState>,
    metadata_queries: AtomicUsize,
    membership_queries: AtomicUsize,
}

impl MockBigSegmentStore {
    /// A store that is reachable, up to date, and has no memberships.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                memberships: HashMap::new(),
                metadata_age: Some(Duration::ZERO),
                metadata_error: false,
                membership_error: false,
                membership_delay: Duration::ZERO,
                queried_hashes: Vec::new(),
            }),
            metadata_queries: AtomicUsize::new(0),
            membership_queries: AtomicUsize::new(0),
        }
    }

    pub fn set_membership(&self, context_key: &str, membership: Membership) {
        self.state
            .lock()
            .memberships
            .insert(hash_context_key(context_key), membership);
    }

    /// How long ago the store was last updated; None if it never reports an update time.
    pub fn set_metadata_age(&self, age: Option<Duration>) {
        self.state.lock().metadata_age = age;
    }

    pub fn set_metadata_error(&self, fail: bool) {
        self.state.lock().metadata_error = fail;
    }

    pub fn set_membership_error(&self, fail: bool) {
        self.state.lock().membership_error = fail;
    }

    pub fn set_membership_delay(&self, delay: Duration) {
        self.state.lock().membership_delay = delay;
    }

    pub fn metadata_queries(&self) -> usize {
        self.metadata_queries.load(Ordering::SeqCst)
    }

    pub fn membership_queries(&self) -> usize {
        self.membership_queries.load(Ordering::SeqCst)
    }

    pub fn queried_hashes(&self) -> Vec<String> {
        self.state.lock().queried_hashes.clone()
    }
}

impl BigSegmentStore for MockBigSegmentStore {
    fn get_metadata(&self) -> Result<StoreMetadata, StoreError> {
        self.metadata_queries.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        if state.metadata_error {
            return Err(StoreError::Unavailable("metadata".into()));
        }
        let now = chrono::Utc::now().timestamp_millis();
        Ok(StoreMetadata {
            last_up_to_date: state.metadata_age.map(|age| now - age.as_millis() as i64),
        })
    }

    fn get_membership(&self, context_hash: &str) -> Result<Membership, StoreError> {
        self.membership_queries.fetch_add(1, Ordering::SeqCst);
        let delay = {
            let mut state = self.state.lock();
            state.queried_hashes.push(context_hash.to_string());
            state.membership_delay
        };
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let state = self.state.lock();
        if state.membership_error {
            return Err(StoreError::Timeout);
        }
        Ok(state
            .memberships
            .get(context_hash)
            .cloned()
            .unwrap_or_default())
    }
}

//! Property tests for frame routing: ordering, deduplication and attribution.

use proptest::prelude::*;

use conclave_session::{
    CombineMode, ConversationId, ConversationLog, InboundFrame, IngestOutcome, LogStore,
    MessageReconciler, ModelRef, ModelSelection, SessionBinding,
};

fn bound_to(id: &ConversationId, logs: &mut LogStore) -> SessionBinding {
    let mut binding = SessionBinding::default();
    binding.select_conversation(id.clone());
    binding.finish_switch(id);
    logs.set_active(Some(id.clone()));
    binding
}

/// Strictly increasing sequences built from positive gaps.
fn increasing_sequences() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(1u64..5, 1..40).prop_map(|gaps| {
        gaps.into_iter()
            .scan(0u64, |acc, gap| {
                *acc += gap;
                Some(*acc)
            })
            .collect()
    })
}

fn texts(log: &ConversationLog) -> Vec<String> {
    log.entries().iter().map(|m| m.text.clone()).collect()
}

proptest! {
    #[test]
    fn increasing_sequences_are_logged_in_arrival_order(seqs in increasing_sequences()) {
        let id = ConversationId::new("a");
        let mut logs = LogStore::default();
        let mut binding = bound_to(&id, &mut logs);
        let reconciler = MessageReconciler::new();

        for seq in &seqs {
            let frame = InboundFrame::token(Some(id.clone()), *seq, &seq.to_string());
            let outcome = reconciler.ingest(&mut binding, &mut logs, frame);
            prop_assert_eq!(outcome, IngestOutcome::Applied { session_id: id.clone() });
        }

        let expected: Vec<String> = seqs.iter().map(u64::to_string).collect();
        prop_assert_eq!(texts(logs.get(&id).unwrap()), expected);
        prop_assert_eq!(logs.get(&id).unwrap().last_seq(), seqs.last().copied());
    }

    #[test]
    fn reingesting_old_frames_never_changes_the_log(
        seqs in increasing_sequences(),
        replays in prop::collection::vec(any::<prop::sample::Index>(), 1..20),
    ) {
        let id = ConversationId::new("a");
        let mut logs = LogStore::default();
        let mut binding = bound_to(&id, &mut logs);
        let reconciler = MessageReconciler::new();

        for seq in &seqs {
            reconciler.ingest(&mut binding, &mut logs, InboundFrame::token(Some(id.clone()), *seq, "x"));
        }
        let before = logs.get(&id).unwrap().clone();

        for idx in &replays {
            let seq = seqs[idx.index(seqs.len())];
            let frame = InboundFrame::token(Some(id.clone()), seq, "replayed");
            reconciler.ingest(&mut binding, &mut logs, frame);
        }

        prop_assert_eq!(logs.get(&id).unwrap(), &before);
        prop_assert_eq!(reconciler.stats().sequence_regressions, replays.len() as u64);
    }

    #[test]
    fn frames_are_never_attributed_to_another_conversation(
        routes in prop::collection::vec(0usize..3, 1..60),
    ) {
        let ids = ["a", "b", "c"].map(ConversationId::new);
        let mut logs = LogStore::default();
        // b is retained off-screen, c is not retained at all
        logs.insert(ids[1].clone(), ConversationLog::new());
        let mut binding = bound_to(&ids[0], &mut logs);
        let reconciler = MessageReconciler::new();

        for (seq, route) in routes.iter().enumerate() {
            let id = &ids[*route];
            let frame = InboundFrame::token(Some(id.clone()), seq as u64 + 1, id.as_str());
            reconciler.ingest(&mut binding, &mut logs, frame);
        }

        for id in &ids[..2] {
            let log = logs.get(id).unwrap();
            prop_assert!(log.entries().iter().all(|m| m.text == id.as_str()));
            let sent = routes.iter().filter(|r| ids[**r] == *id).count();
            prop_assert_eq!(log.len(), sent);
        }
        prop_assert!(logs.get(&ids[2]).is_none());
    }

    #[test]
    fn switching_away_and_back_leaves_log_unchanged(
        a_frames in 0usize..10,
        b_frames in 0usize..10,
    ) {
        let a = ConversationId::new("a");
        let b = ConversationId::new("b");
        let mut logs = LogStore::default();
        let mut binding = bound_to(&a, &mut logs);
        let reconciler = MessageReconciler::new();

        for seq in 1..=a_frames as u64 {
            reconciler.ingest(&mut binding, &mut logs, InboundFrame::token(Some(a.clone()), seq, "a"));
        }
        let a_before = logs.get(&a).unwrap().clone();

        binding.select_conversation(b.clone());
        logs.set_active(Some(b.clone()));
        binding.finish_switch(&b);
        for seq in 1..=b_frames as u64 {
            reconciler.ingest(&mut binding, &mut logs, InboundFrame::token(Some(b.clone()), seq, "b"));
        }

        binding.select_conversation(a.clone());
        logs.set_active(Some(a.clone()));
        binding.finish_switch(&a);

        prop_assert_eq!(logs.get(&a).unwrap(), &a_before);
        prop_assert_eq!(logs.get(&a).unwrap().len(), a_frames);
    }

    #[test]
    fn normalized_selection_never_violates_mode_minimum(
        models in prop::collection::btree_set("[a-d]", 0..4),
        mode in prop_oneof![
            Just(CombineMode::Single),
            Just(CombineMode::Consensus),
            Just(CombineMode::Debate),
        ],
    ) {
        let selection = ModelSelection::new(models.iter().map(|m| ModelRef::new(m.as_str())), mode);
        let normalized = selection.normalized();
        prop_assert!(
            normalized.combine_mode == CombineMode::Single
                || normalized.enabled_models.len() >= 2
        );
        prop_assert_eq!(normalized.enabled_models, selection.enabled_models);
    }
}

mod common;

use common::*;
use facegate_core::enrollment::FeedOutcome;
use facegate_core::{
    EnrollmentConfig, EnrollmentController, EnrollmentState, Gallery, MemoryStore, ReenrollPolicy,
    StateKind,
};
use rstest::rstest;

fn controller(sample_count: usize) -> EnrollmentController {
    let config = EnrollmentConfig {
        sample_count,
        min_valid_samples: sample_count.min(3),
        ..EnrollmentConfig::default()
    };
    EnrollmentController::new(config).unwrap()
}

#[test]
fn bob_completes_on_fifth_accepted_sample_not_fifth_frame() {
    let gallery = Gallery::open(MemoryStore::new()).unwrap();
    let mut ctl = controller(5);
    // Frames 3 and 4 carry no face.
    let mut detector = SequenceDetector::new(|seq| if seq == 3 || seq == 4 { vec![] } else { vec![good_face()] });
    let mut embedder = NearEmbedder::new(base_vector());

    ctl.start("bob").unwrap();
    let mut frames_fed = 0;
    for seq in 0..10 {
        if ctl.state().kind() != StateKind::Collecting {
            break;
        }
        ctl.feed(&textured_frame(seq), &mut detector).unwrap();
        frames_fed += 1;
        if seq == 4 {
            assert_eq!(ctl.state(), &EnrollmentState::Collecting, "still collecting after the empty frames");
        }
    }

    assert_eq!(frames_fed, 7);
    assert_eq!(ctl.state(), &EnrollmentState::Validating);

    ctl.validate(&mut embedder).unwrap();
    let EnrollmentState::Completed { identity_id } = ctl.commit(&gallery).unwrap().clone() else {
        panic!("bob should have been committed");
    };

    let bob = gallery.get(&identity_id).unwrap();
    assert_eq!(bob.name(), "bob");
    assert_eq!(bob.embeddings().len(), 5);

    let events = ctl.drain_events();
    let validating = events.iter().find(|e| e.to.kind() == StateKind::Validating).unwrap();
    assert_eq!(validating.accepted_samples, 5);
    assert_eq!(validating.counters.no_face, 2);
    assert_eq!(validating.counters.frames_seen, 7);
}

#[rstest]
#[case(1)]
#[case(3)]
#[case(5)]
fn session_never_completes_with_fewer_samples_than_required(#[case] required: usize) {
    let gallery = Gallery::open(MemoryStore::new()).unwrap();
    let mut ctl = controller(required);
    let mut detector = SequenceDetector::always_one();
    ctl.start("erin").unwrap();

    for seq in 0..required as u64 - 1 {
        let outcome = ctl.feed(&textured_frame(seq), &mut detector).unwrap();
        assert!(matches!(outcome, FeedOutcome::Accepted { .. }));
        assert_eq!(ctl.state(), &EnrollmentState::Collecting);
        // Out-of-order steps are refused while collecting.
        assert!(ctl.commit(&gallery).is_err());
    }
    ctl.feed(&textured_frame(required as u64), &mut detector).unwrap();
    assert_eq!(ctl.state(), &EnrollmentState::Validating);
}

#[test]
fn cancel_before_commit_leaves_store_untouched() {
    let store = MemoryStore::new();
    let gallery = Gallery::open(store.clone()).unwrap();
    gallery.commit_enrollment("alice", candidates(&base_vector(), 3), ReenrollPolicy::Replace).unwrap();
    let rows_before = store.rows();
    let writes_before = store.write_count();

    let mut detector = SequenceDetector::always_one();

    // Cancelled while collecting.
    let mut ctl = controller(5);
    ctl.start("alice").unwrap();
    ctl.feed(&textured_frame(0), &mut detector).unwrap();
    ctl.cancel().unwrap();

    // Cancelled once every sample is in, before validation ran.
    ctl.start("alice").unwrap();
    for seq in 0..5 {
        ctl.feed(&textured_frame(seq), &mut detector).unwrap();
    }
    assert_eq!(ctl.state().kind(), StateKind::Validating);
    ctl.cancel().unwrap();

    assert_eq!(ctl.state(), &EnrollmentState::Cancelled);
    assert_eq!(store.rows(), rows_before);
    assert_eq!(store.write_count(), writes_before);
    assert_eq!(gallery.find_by_name("alice").unwrap().embeddings().len(), 3);
}

#[test]
fn reenrollment_replaces_existing_identity() {
    let gallery = Gallery::open(MemoryStore::new()).unwrap();
    let original = gallery.commit_enrollment("Bob", candidates(&base_vector(), 3), ReenrollPolicy::Replace).unwrap();

    let mut ctl = controller(5);
    let mut detector = SequenceDetector::always_one();
    let mut embedder = NearEmbedder::new(vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    ctl.start("bob").unwrap();
    for seq in 0..5 {
        ctl.feed(&textured_frame(seq), &mut detector).unwrap();
    }
    ctl.validate(&mut embedder).unwrap();
    ctl.commit(&gallery).unwrap();

    let bob = gallery.find_by_name("BOB").unwrap();
    assert_eq!(bob.id(), original.id());
    assert_eq!(bob.embeddings().len(), 5);
    assert_eq!(gallery.stats().identities, 1);
}

#[test]
fn events_follow_transition_order() {
    let gallery = Gallery::open(MemoryStore::new()).unwrap();
    let mut ctl = controller(3);
    let mut detector = SequenceDetector::always_one();
    let mut embedder = NearEmbedder::new(base_vector());

    ctl.start("fay").unwrap();
    for seq in 0..3 {
        ctl.feed(&textured_frame(seq), &mut detector).unwrap();
    }
    ctl.validate(&mut embedder).unwrap();
    ctl.commit(&gallery).unwrap();

    let events = ctl.drain_events();
    for pair in events.windows(2) {
        assert_eq!(pair[0].to, pair[1].from);
        assert!(pair[0].to.can_transition_to(&pair[1].to));
    }
    assert_eq!(events.first().map(|e| e.from.kind()), Some(StateKind::Idle));
    assert_eq!(events.last().map(|e| e.to.kind()), Some(StateKind::Completed));
}

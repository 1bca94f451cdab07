use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;
use crate::internal::test_utils::assert;

#[test]
fn noop_callback_does_nothing_observable() {
    let cb = NoopCallback;
    cb.on_state(TransState::Download, StateDetail::Phase);
    cb.on_unpack(UnpackProgress {
        pkgver: "foo-1.0_1".to_string(),
        entries_total: 1,
        entries_done: 1,
    });
}

#[test]
fn custom_callback_is_invoked_per_pkg() {
    struct Counting(AtomicUsize);
    impl StateCallback for Counting {
        fn on_state(&self, _state: TransState, _detail: StateDetail) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let cb = Counting(AtomicUsize::new(0));
    cb.on_state(
        TransState::Run,
        StateDetail::Pkg { pkgver: "foo-1.0_1".to_string() },
    );
    cb.on_state(
        TransState::Configure,
        StateDetail::Pkg { pkgver: "foo-1.0_1".to_string() },
    );
    assert!(cb.0.load(Ordering::SeqCst) == 2);
}

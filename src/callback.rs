use crate::fetch::FetchProgress;

/// The phases a transaction's Run step announces, plus the surrounding
/// Download/Verify/Files/Configure phases (design §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransState {
    Download,
    Verify,
    Files,
    Run,
    Configure,
}

/// Detail accompanying a state-callback invocation.
#[derive(Debug, Clone)]
pub enum StateDetail {
    /// A phase started or finished for the whole transaction.
    Phase,
    /// A single package entered the named phase.
    Pkg { pkgver: String },
    /// `init` found a pkg left in a half-state; the CLI typically finishes
    /// the transition before starting a new transaction.
    HalfState { pkgver: String, state: crate::pkg::PkgState },
    /// A free-form diagnostic message (script output, repo sync notices).
    Message(String),
}

/// Progress during the Files-collection / unpack step.
#[derive(Debug, Clone)]
pub struct UnpackProgress {
    pub pkgver: String,
    pub entries_total: u64,
    pub entries_done: u64,
}

/// Coroutine-style callbacks for progress/state reporting during long
/// synchronous operations, per the design's notes on the source's C
/// callbacks. Absence of a handler is a silent no-op; handlers may be
/// invoked from any worker thread and must not themselves take the pkgdb
/// lock.
pub trait StateCallback: Send + Sync {
    fn on_state(&self, _state: TransState, _detail: StateDetail) {}
    fn on_fetch(&self, _progress: FetchProgress) {}
    fn on_unpack(&self, _progress: UnpackProgress) {}
}

/// The default, silent callback.
pub struct NoopCallback;

impl StateCallback for NoopCallback {}

#[cfg(test)]
#[path = "callback.test.rs"]
mod test;

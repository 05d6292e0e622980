//! Rudder dispatch: classify trait manifests into stages and apply them in
//! order, holding later stages back until earlier ones report healthy.

#![forbid(unsafe_code)]

pub mod dispatcher;
pub mod stage;
pub mod state;

pub use dispatcher::{
    generate_dispatchers, run_dispatchers, ComponentManifests, DispatchEnv, DispatchOption, ManifestDispatcher,
    WAITING_COMPONENT, WAITING_PREVIOUS_STAGE,
};
pub use stage::{classify_stage, StageType};
pub use state::ReconcileState;

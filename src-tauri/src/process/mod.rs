/// Backend process supervision
///
/// `backend` drives the OS process, `supervisor` turns what it observes into
/// connection states, `state` holds the types both share with the rest of
/// the shell.
pub mod backend;
pub mod state;
pub mod supervisor;

pub use backend::{BackendProcess, InstanceEvent, LaunchSpec, ProcessEvent, DEFAULT_KILL_GRACE};
pub use state::{Endpoint, EndpointView, GoneReason, SupervisorState};
pub use supervisor::{Supervisor, SupervisorEvent};

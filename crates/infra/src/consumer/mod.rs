//! Consumer-group side of the event log: group registration and the polling loop.

pub mod poller;
pub mod registrar;

pub use poller::{ConsumerGroupPoller, PollerHandle, PollerStats};
pub use registrar::{ConsumerGroupRegistrar, GroupRegistration, RegistrationReport};

/// Deterministic stand-ins for the sandbox layer, with configurable delays
/// and call counting. Used to exercise the pipeline and the scheduler
/// without touching the kernel.
pub mod executor;
pub mod provisioner;

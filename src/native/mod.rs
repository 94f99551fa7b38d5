/// Linux implementation of the sandbox seams, without Docker or runc:
/// cgroup v2 limit groups, namespaces and rlimits through syscalls.
pub mod cgroup;
pub mod executor;
pub mod process;
pub mod provisioner;

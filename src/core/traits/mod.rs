pub mod comparator;
pub mod executor;
pub mod provisioner;

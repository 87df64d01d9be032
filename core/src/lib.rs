pub mod bus;
pub mod debuggable;
pub mod scsi;
pub mod tickable;
pub mod trm;
pub mod types;

#[cfg(test)]
pub mod test;

use anyhow::Result;

/// Representation of X amount of ticks (milliseconds)
/// of the adapter's watchdog clock.
pub type Ticks = u64;

pub trait Tickable {
    fn tick(&mut self, ticks: Ticks) -> Result<Ticks>;
}

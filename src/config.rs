//! Map-wide tunables.

/// Default initial index table size.
pub const DEFAULT_SIZE: usize = 8;

/// Fill-rate percentage past which an insert requests a grow.
pub const MAX_FILL_RATE: usize = 50;

/// Construction-time tunables for [`crate::HashMap`].
///
/// Plays the role `conc::settings::Settings` plays for that crate's
/// reclamation knobs: a small, explicit struct handed to the constructor
/// instead of global mutable state.
#[derive(Debug, Clone)]
pub struct Config {
    /// Index table size allocated the first time the map grows from empty.
    /// Need not be a power of two — the resize coordinator rounds it up
    /// before allocating, same as any other grow target.
    pub default_size: usize,
    /// Fill-rate percentage (occupied slots / total slots × 100) past
    /// which inserts request a grow.
    pub max_fill_rate: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_size: DEFAULT_SIZE,
            max_fill_rate: MAX_FILL_RATE,
        }
    }
}

/// Backlog used when `bind` is given a non-positive value.
pub const DEFAULT_BACKLOG: u32 = 50;

/// Largest number of bytes staged for one native receive.
pub const DEFAULT_MAX_RECEIVE_SIZE: usize = 65536;

/// Number of staging buffers each channel keeps for reuse.
pub const DEFAULT_POOLED_BUFFERS: usize = 4;

/// Per-channel tuning.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Backlog used when `bind` is given a non-positive value.
    pub default_backlog: u32,

    /// Upper bound on the staging buffer for one receive. A message larger
    /// than this (or than the caller's buffer) is delivered in parts.
    pub max_receive_size: usize,

    /// Staging buffers kept for reuse after a receive returns.
    pub pooled_buffers: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            default_backlog: DEFAULT_BACKLOG,
            max_receive_size: DEFAULT_MAX_RECEIVE_SIZE,
            pooled_buffers: DEFAULT_POOLED_BUFFERS,
        }
    }
}

impl ChannelConfig {
    /// Defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default backlog.
    pub fn default_backlog(mut self, backlog: u32) -> Self {
        self.default_backlog = backlog.max(1);
        self
    }

    /// Set the largest staged receive.
    pub fn max_receive_size(mut self, size: usize) -> Self {
        self.max_receive_size = size.max(1);
        self
    }

    /// Set how many staging buffers are kept.
    pub fn pooled_buffers(mut self, count: usize) -> Self {
        self.pooled_buffers = count;
        self
    }

    /// Resolve a caller supplied backlog.
    pub(crate) fn backlog(&self, requested: i32) -> u32 {
        if requested < 1 {
            self.default_backlog
        } else {
            requested as u32
        }
    }
}

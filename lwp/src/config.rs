use crate::stack;

/// Used when `RLIMIT_STACK` is unlimited or unreadable.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024 * 8; // 8MB
/// Smaller requests are bumped up to this.
pub const MIN_STACK_SIZE: usize = 1024 * 16; // 16KB

/// Runtime settings, fixed for the lifetime of a runtime.
#[derive(Debug, Clone)]
pub struct Config {
    stack_size: Option<usize>,
    guard_page: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            stack_size: None,
            guard_page: true,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stack size for threads made by `create`. Without this the soft
    /// `RLIMIT_STACK` of the process is used.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Whether each stack gets an inaccessible page below it. On by default.
    pub fn guard_page(mut self, enabled: bool) -> Self {
        self.guard_page = enabled;
        self
    }

    pub fn has_guard_page(&self) -> bool {
        self.guard_page
    }

    /// Usable stack bytes per thread, page aligned. A size too large to round
    /// is kept as is and fails later, when the stack is mapped.
    pub fn resolved_stack_size(&self) -> usize {
        let size = self
            .stack_size
            .unwrap_or_else(stack::default_stack_size)
            .max(MIN_STACK_SIZE);
        stack::round_up(size, stack::page_size()).unwrap_or(size)
    }
}

use crate::flasher::FlashState;

/// Progress update callbacks
pub trait ProgressCallbacks {
    /// Initialize some progress report
    fn init(&mut self, total: usize);
    /// Update some progress report
    fn update(&mut self, current: usize);
    /// Finish some progress report
    fn finish(&mut self);
    /// The upload moved to a new stage
    fn stage(&mut self, _state: FlashState) {}
}

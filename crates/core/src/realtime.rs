#[cfg(feature = "realtime")]
use audio_thread_priority::{
    RtPriorityHandle, demote_current_thread_from_real_time, promote_current_thread_to_real_time,
};

/// Real-time scheduling for the current thread, released on drop.
///
/// Promotion is best effort. Without the `realtime` feature, or when the OS
/// refuses, the thread keeps its normal priority.
pub(crate) struct RealtimePriority {
    #[cfg(feature = "realtime")]
    handle: Option<RtPriorityHandle>,
}

impl RealtimePriority {
    #[cfg(feature = "realtime")]
    pub fn promote(window_frames: u32, sample_rate: u32) -> Self {
        match promote_current_thread_to_real_time(window_frames, sample_rate) {
            Ok(handle) => {
                tracing::debug!(window_frames, sample_rate, "timing thread promoted to real time");
                Self {
                    handle: Some(handle),
                }
            }
            Err(err) => {
                tracing::warn!(?err, "timing thread could not be promoted to real time");
                Self { handle: None }
            }
        }
    }

    #[cfg(not(feature = "realtime"))]
    pub fn promote(_window_frames: u32, _sample_rate: u32) -> Self {
        tracing::debug!("real-time priority not compiled in");
        Self {}
    }

    pub fn is_promoted(&self) -> bool {
        #[cfg(feature = "realtime")]
        {
            self.handle.is_some()
        }
        #[cfg(not(feature = "realtime"))]
        {
            false
        }
    }
}

impl Drop for RealtimePriority {
    fn drop(&mut self) {
        #[cfg(feature = "realtime")]
        if let Some(handle) = self.handle.take() {
            if let Err(err) = demote_current_thread_from_real_time(handle) {
                tracing::warn!(?err, "failed to demote timing thread");
            }
        }
    }
}

//! Progress callbacks exposed to the embedder.

use std::time::Duration;

use super::stats::SpeedStatistics;

type Notify = Box<dyn Fn() + Send + Sync>;
type Speed = Box<dyn Fn(u64) + Send + Sync>;
type Text = Box<dyn Fn(&str) + Send + Sync>;

/// Every callback the manager invokes, built once and handed to
/// [`SpeedTestManager::new`](super::SpeedTestManager::new).
///
/// Unset callbacks default to no-ops; the default `on_download_finish`
/// starts the upload without delay. Callbacks run while the manager holds
/// its state lock, so they must not call back into the manager.
///
/// ```
/// use std::time::Duration;
/// use speedcheck::speedtest::Callbacks;
///
/// let callbacks = Callbacks {
///     on_download_speed_update: Box::new(|bps| println!("{} bit/s", bps)),
///     on_download_finish: Box::new(|_| Duration::from_secs(1)),
///     ..Callbacks::default()
/// };
/// # drop(callbacks);
/// ```
pub struct Callbacks {
    pub on_ping_update: Speed,
    pub on_download_start: Notify,
    pub on_download_speed_update: Speed,
    /// Returns how long to wait before the upload phase starts.
    pub on_download_finish: Box<dyn Fn(&SpeedStatistics) -> Duration + Send + Sync>,
    pub on_upload_start: Notify,
    pub on_upload_speed_update: Speed,
    pub on_upload_finish: Box<dyn Fn(&SpeedStatistics) + Send + Sync>,
    pub on_finish: Notify,
    pub on_stopped: Notify,
    pub on_log: Text,
    pub on_fatal_error: Text,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self {
            on_ping_update: Box::new(|_| {}),
            on_download_start: Box::new(|| {}),
            on_download_speed_update: Box::new(|_| {}),
            on_download_finish: Box::new(|_| Duration::ZERO),
            on_upload_start: Box::new(|| {}),
            on_upload_speed_update: Box::new(|_| {}),
            on_upload_finish: Box::new(|_| {}),
            on_finish: Box::new(|| {}),
            on_stopped: Box::new(|| {}),
            on_log: Box::new(|_| {}),
            on_fatal_error: Box::new(|_| {}),
        }
    }
}

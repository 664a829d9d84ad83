//! Recurrent stereo disparity refinement.
//!
//! Umbrella crate over the workspace members: rank-bounded tensors
//! ([`core`]), spatial tensor operators ([`imgproc`]) and the refinement
//! network itself ([`stereo`]).

pub use cv_core as core;
pub use cv_imgproc as imgproc;
pub use cv_stereo as stereo;

pub use cv_stereo::{DisparityMap, RaftStereo, StereoConfig, StereoMatcher};

/// Size the shared worker pool before the first refinement call.
///
/// The explicit count takes precedence over the `CV_STEREO_THREADS`
/// environment variable; with neither, Rayon picks. Returns the worker count
/// of the pool actually in use.
pub fn init_thread_pool(num_threads: Option<usize>) -> cv_core::Result<usize> {
    cv_core::init_global_thread_pool(num_threads)
}

use rayon::ThreadPoolBuilder;
use std::env;
use std::sync::OnceLock;

/// Environment variable consulted when no explicit thread count is given.
pub const THREADS_ENV: &str = "CV_STEREO_THREADS";

static THREAD_POOL: OnceLock<Result<usize, String>> = OnceLock::new();

/// Size the global Rayon pool that every tensor operator runs on.
///
/// Only the first call builds the pool; later calls return the first
/// outcome. Returns the resulting worker count.
///
/// Priority: `num_threads`, then [`THREADS_ENV`], then the Rayon default.
pub fn init_global_thread_pool(num_threads: Option<usize>) -> crate::Result<usize> {
    THREAD_POOL
        .get_or_init(|| {
            let env_value = env::var(THREADS_ENV).ok();
            let requested = resolve_thread_count(num_threads, env_value.as_deref())?;
            let mut builder = ThreadPoolBuilder::new();
            if let Some(n) = requested {
                builder = builder.num_threads(n);
            }
            builder.build_global().map_err(|e| e.to_string())?;
            Ok(rayon::current_num_threads())
        })
        .clone()
        .map_err(crate::Error::InvalidParameters)
}

pub fn current_cpu_threads() -> usize {
    rayon::current_num_threads()
}

/// Thread count to request, `None` meaning the Rayon default.
fn resolve_thread_count(
    explicit: Option<usize>,
    env_value: Option<&str>,
) -> Result<Option<usize>, String> {
    let requested = match (explicit, env_value) {
        (Some(n), _) => n,
        (None, Some(raw)) => raw
            .trim()
            .parse()
            .map_err(|_| format!("{} must be a positive integer, got '{}'", THREADS_ENV, raw))?,
        (None, None) => return Ok(None),
    };
    if requested == 0 {
        return Err("thread count must be at least 1".to_string());
    }
    Ok(Some(requested))
}

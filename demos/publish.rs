//! Minimal producer: publish a single 1920x1080 ARGB8888 stream and feed
//! it solid-colour frames until interrupted.

use std::sync::Arc;

use lamco_pw_stream::allocator::gbm::GbmAllocator;
use lamco_pw_stream::{Context, PacingMode, Stream};

fn main() -> lamco_pw_stream::Result<()> {
    tracing_subscriber::fmt::init();

    let context = Arc::new(Context::connect()?);
    let backend = Box::new(GbmAllocator::open("/dev/dri/renderD128")?);
    let mut stream = Stream::new(context, "lamco-pw-stream-demo", backend)?;

    stream.set_size(1920, 1080)?;
    stream.set_mode(PacingMode::Async);
    stream.add_format(
        smithay::reexports::drm::buffer::DrmFourcc::Argb8888,
        vec![smithay::reexports::gbm::Modifier::Linear],
    )?;
    stream.configure()?;
    stream.start()?;

    for _ in 0..600 {
        match stream.dequeue()? {
            Some(handle) => stream.enqueue(handle)?,
            None => std::thread::sleep(std::time::Duration::from_millis(16)),
        }
    }

    stream.stop()?;
    Ok(())
}

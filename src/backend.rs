//! GPIO line acquisition.
//!
//! The server never looks inside a held request. It asks a [`LineBackend`]
//! for a handle, keeps it, and drops it to give the lines back.

use gpio_cdev::{Chip, LineRequestFlags, MultiLineHandle};
use std::error::Error;
use std::io;

use crate::protocol::LineRequestSpec;

/// Consumer label used when the client did not pass one.
pub const DEFAULT_CONSUMER: &str = "gpioctl";

/// Source of GPIO line requests.
///
/// Implementations must release the lines when the returned handle is
/// dropped. Errors are reported as OS errors so their errno can travel back
/// to the client.
pub trait LineBackend {
    /// Opaque token for a set of held lines.
    type Handle;

    fn request_lines(&mut self, spec: &LineRequestSpec) -> io::Result<Self::Handle>;
}

/// Backend on top of the kernel GPIO character device.
#[derive(Debug, Default)]
pub struct CdevBackend;

impl CdevBackend {
    pub fn new() -> Self {
        Self
    }
}

impl LineBackend for CdevBackend {
    type Handle = MultiLineHandle;

    fn request_lines(&mut self, spec: &LineRequestSpec) -> io::Result<MultiLineHandle> {
        let mut flags = if spec.output() {
            LineRequestFlags::OUTPUT
        } else {
            LineRequestFlags::INPUT
        };
        if spec.active_low() {
            flags |= LineRequestFlags::ACTIVE_LOW;
        }

        let consumer = if spec.consumer().is_empty() {
            DEFAULT_CONSUMER
        } else {
            spec.consumer()
        };

        let mut chip = Chip::new(spec.chip_path()).map_err(cdev_to_io)?;
        let lines = chip.get_lines(spec.offsets()).map_err(cdev_to_io)?;
        lines
            .request(flags, spec.values(), consumer)
            .map_err(cdev_to_io)
    }
}

/// Map a gpio-cdev error onto the errno the kernel reported.
pub(crate) fn cdev_to_io(err: gpio_cdev::Error) -> io::Error {
    io::Error::from_raw_os_error(cdev_errno(&err))
}

/// Kernel failures surface as the error's source: an `io::Error` from
/// opening the device, or the `Errno` of a failed ioctl. Errors without a
/// source are gpio-cdev's own argument checks (offset out of range, wrong
/// number of values).
fn cdev_errno(err: &(dyn Error + 'static)) -> i32 {
    match err.source() {
        Some(cause) => cause_errno(cause),
        None => libc::EINVAL,
    }
}

fn cause_errno(cause: &(dyn Error + 'static)) -> i32 {
    if let Some(io_err) = cause.downcast_ref::<io::Error>() {
        io_err.raw_os_error().unwrap_or(libc::EIO)
    } else if let Some(errno) = cause.downcast_ref::<cdev_nix::errno::Errno>() {
        *errno as i32
    } else {
        libc::EIO
    }
}

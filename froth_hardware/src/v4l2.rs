//! Live capture from a V4L2 device node such as a USB camera.
//!
//! The camera asks for YUYV at the configured size and rate; drivers that
//! only stream Motion-JPEG are accepted too. Whatever size the driver
//! settles on is what `grab` returns.
use std::io;
use std::time::Duration;

use froth_traits::Camera;
use image::RgbImage;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::video::capture::Parameters;
use v4l::{Device, FourCC};

use crate::error::HwError;
use crate::pixel::{mjpeg_to_rgb, yuyv_to_rgb};

/// Kernel buffers queued for capture.
const BUFFERS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
    Yuyv,
    Mjpeg,
}

impl PixelFormat {
    fn of(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"MJPG" => Some(Self::Mjpeg),
            _ => None,
        }
    }
}

struct Session {
    // Declared first so the mapped buffers go before the device handle.
    stream: Stream<'static>,
    _device: Device,
    format: PixelFormat,
    width: u32,
    height: u32,
}

pub struct V4l2Camera {
    path: String,
    width: u32,
    height: u32,
    fps: u32,
    session: Option<Session>,
}

impl V4l2Camera {
    pub fn new(path: impl Into<String>, width: u32, height: u32, fps: u32) -> Self {
        Self {
            path: path.into(),
            width,
            height,
            fps,
            session: None,
        }
    }

    fn start(&self) -> crate::error::Result<Session> {
        let unavailable = |what: &str, e: io::Error| {
            HwError::DeviceUnavailable(format!("{}: {what}: {e}", self.path))
        };
        let device = Device::with_path(&self.path).map_err(|e| unavailable("open", e))?;

        let mut fmt = device.format().map_err(|e| unavailable("query format", e))?;
        fmt.width = self.width;
        fmt.height = self.height;
        fmt.fourcc = FourCC::new(b"YUYV");
        let fmt = device
            .set_format(&fmt)
            .map_err(|e| unavailable("set format", e))?;
        let format = PixelFormat::of(fmt.fourcc).ok_or_else(|| {
            HwError::DeviceUnavailable(format!(
                "{}: unsupported pixel format {}",
                self.path, fmt.fourcc
            ))
        })?;
        if (fmt.width, fmt.height) != (self.width, self.height) {
            warn!(
                requested = ?(self.width, self.height),
                granted = ?(fmt.width, fmt.height),
                "camera chose a different frame size"
            );
        }

        if let Err(e) = device.set_params(&Parameters::with_fps(self.fps)) {
            warn!(fps = self.fps, error = %e, "camera rejected the frame rate; using its default");
        }

        let stream = Stream::with_buffers(&device, Type::VideoCapture, BUFFERS)
            .map_err(|e| unavailable("start stream", e))?;
        info!(
            device = %self.path,
            width = fmt.width,
            height = fmt.height,
            format = ?format,
            fps = self.fps,
            "v4l2 capture started"
        );
        Ok(Session {
            stream,
            _device: device,
            format,
            width: fmt.width,
            height: fmt.height,
        })
    }
}

impl Camera for V4l2Camera {
    fn open(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.session = None;
        self.session = Some(self.start()?);
        Ok(())
    }

    fn grab(
        &mut self,
        timeout: Duration,
    ) -> Result<RgbImage, Box<dyn std::error::Error + Send + Sync>> {
        let Some(s) = self.session.as_mut() else {
            return Err(Box::new(HwError::DeviceUnavailable(format!(
                "{} not open",
                self.path
            ))));
        };
        s.stream.set_timeout(timeout);
        let (buf, meta) = s.stream.next().map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => HwError::Timeout,
            _ => HwError::Io(e),
        })?;
        let used = (meta.bytesused as usize).min(buf.len());
        let frame = match s.format {
            PixelFormat::Yuyv => yuyv_to_rgb(s.width, s.height, &buf[..used])?,
            PixelFormat::Mjpeg => mjpeg_to_rgb(&buf[..used])?,
        };
        Ok(frame)
    }

    fn release(&mut self) {
        if self.session.take().is_some() {
            debug!(device = %self.path, "v4l2 capture stopped");
        }
    }
}

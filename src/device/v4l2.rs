//! V4L2 device calls over raw VIDIOC_* ioctls

use std::fs::OpenOptions;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, info, instrument, warn};
use v4l::capability::Flags as CapFlags;
use v4l::v4l_sys::{
    v4l2_buffer, v4l2_capability, v4l2_control, v4l2_crop, v4l2_format, v4l2_framebuffer,
    v4l2_requestbuffers, v4l2_streamparm,
};
use v4l::{Fraction, FourCC};

use super::{
    Blending, BufKind, BufferInfo, DeviceCaps, MemoryMode, PixFormat, Rect, UserPtr, VideoDevice,
};

const V4L2_CID_ROTATE: u32 = 0x0098_0922;
const V4L2_CAP_DEVICE_CAPS: u32 = 0x8000_0000;
const V4L2_BUF_FLAG_MAPPED: u32 = 0x0000_0001;
const V4L2_FIELD_NONE: u32 = 1;

mod ioctl {
    use super::*;

    nix::ioctl_read!(querycap, b'V', 0, v4l2_capability);
    nix::ioctl_readwrite!(g_fmt, b'V', 4, v4l2_format);
    nix::ioctl_readwrite!(s_fmt, b'V', 5, v4l2_format);
    nix::ioctl_readwrite!(reqbufs, b'V', 8, v4l2_requestbuffers);
    nix::ioctl_readwrite!(querybuf, b'V', 9, v4l2_buffer);
    nix::ioctl_read!(g_fbuf, b'V', 10, v4l2_framebuffer);
    nix::ioctl_write_ptr!(s_fbuf, b'V', 11, v4l2_framebuffer);
    nix::ioctl_readwrite!(qbuf, b'V', 15, v4l2_buffer);
    nix::ioctl_readwrite!(dqbuf, b'V', 17, v4l2_buffer);
    nix::ioctl_write_ptr!(streamon, b'V', 18, libc::c_int);
    nix::ioctl_write_ptr!(streamoff, b'V', 19, libc::c_int);
    nix::ioctl_readwrite!(g_parm, b'V', 21, v4l2_streamparm);
    nix::ioctl_readwrite!(s_parm, b'V', 22, v4l2_streamparm);
    nix::ioctl_readwrite!(s_ctrl, b'V', 28, v4l2_control);
    nix::ioctl_readwrite!(g_crop, b'V', 59, v4l2_crop);
    nix::ioctl_write_ptr!(s_crop, b'V', 60, v4l2_crop);
}

/// A V4L2 video node.
pub struct V4l2Device {
    fd: OwnedFd,
}

impl V4l2Device {
    /// Open a device node read/write.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        info!("Opened video device {}", path.display());
        Ok(Self { fd: file.into() })
    }

    /// Wrap a descriptor received from the geometry-owning side.
    pub fn from_fd(fd: OwnedFd) -> Self {
        debug!("Wrapping video device fd {}", fd.as_raw_fd());
        Self { fd }
    }

    fn get_format(&self, kind: BufKind) -> io::Result<v4l2_format> {
        let mut fmt: v4l2_format = unsafe { mem::zeroed() };
        fmt.type_ = kind.raw();
        unsafe { ioctl::g_fmt(self.raw_fd(), &mut fmt) }.map_err(errno("get format"))?;
        Ok(fmt)
    }

    fn apply_format(&self, mut fmt: v4l2_format) -> io::Result<v4l2_format> {
        unsafe { ioctl::s_fmt(self.raw_fd(), &mut fmt) }.map_err(errno("set format"))?;
        Ok(fmt)
    }

    fn buffer_desc(kind: BufKind, memory: MemoryMode, index: u32) -> v4l2_buffer {
        let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
        buf.type_ = kind.raw();
        buf.memory = memory.raw();
        buf.index = index;
        buf
    }
}

fn errno(what: &'static str) -> impl Fn(nix::errno::Errno) -> io::Error {
    move |e| {
        debug!("{} failed: {}", what, e);
        io::Error::from(e)
    }
}

fn pix_format(fmt: &v4l2_format) -> PixFormat {
    let pix = unsafe { fmt.fmt.pix };
    PixFormat {
        width: pix.width,
        height: pix.height,
        fourcc: FourCC::from(pix.pixelformat),
        bytes_per_line: pix.bytesperline,
        size_image: pix.sizeimage,
    }
}

fn buffer_info(buf: &v4l2_buffer) -> BufferInfo {
    BufferInfo {
        index: buf.index,
        length: buf.length,
        offset: unsafe { buf.m.offset },
        bytes_used: buf.bytesused,
        timestamp: Duration::from_secs(buf.timestamp.tv_sec as u64)
            + Duration::from_micros(buf.timestamp.tv_usec as u64),
        mapped: buf.flags & V4L2_BUF_FLAG_MAPPED != 0,
    }
}

fn c_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl VideoDevice for V4l2Device {
    fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn capabilities(&self) -> io::Result<DeviceCaps> {
        let mut caps: v4l2_capability = unsafe { mem::zeroed() };
        unsafe { ioctl::querycap(self.raw_fd(), &mut caps) }.map_err(errno("query cap"))?;

        let bits = if caps.capabilities & V4L2_CAP_DEVICE_CAPS != 0 {
            caps.device_caps
        } else {
            caps.capabilities
        };
        let flags = CapFlags::from_bits_truncate(bits);

        Ok(DeviceCaps {
            driver: c_str(&caps.driver),
            card: c_str(&caps.card),
            capture: flags.contains(CapFlags::VIDEO_CAPTURE),
            output: flags.contains(CapFlags::VIDEO_OUTPUT),
            streaming: flags.contains(CapFlags::STREAMING),
        })
    }

    fn format(&self, kind: BufKind) -> io::Result<PixFormat> {
        self.get_format(kind).map(|fmt| pix_format(&fmt))
    }

    fn set_format(
        &self,
        kind: BufKind,
        width: u32,
        height: u32,
        fourcc: FourCC,
    ) -> io::Result<PixFormat> {
        let mut fmt = self.get_format(kind)?;
        unsafe {
            fmt.fmt.pix.width = width;
            fmt.fmt.pix.height = height;
            fmt.fmt.pix.pixelformat = fourcc.into();
        }
        // S_FMT writes back what the driver settled on
        let fmt = self.apply_format(fmt)?;
        Ok(pix_format(&fmt))
    }

    fn reset_format(&self, kind: BufKind) -> io::Result<PixFormat> {
        let fmt = self.get_format(kind)?;
        self.apply_format(fmt)?;
        self.format(kind)
    }

    fn frame_interval(&self) -> io::Result<Fraction> {
        let mut parm: v4l2_streamparm = unsafe { mem::zeroed() };
        parm.type_ = BufKind::Capture.raw();
        unsafe { ioctl::g_parm(self.raw_fd(), &mut parm) }.map_err(errno("get parm"))?;
        let tpf = unsafe { parm.parm.capture.timeperframe };
        Ok(Fraction::new(tpf.numerator, tpf.denominator))
    }

    fn set_frame_interval(&self, interval: Fraction) -> io::Result<Fraction> {
        // Some drivers reject S_PARM unless it carries what G_PARM returned
        let mut parm: v4l2_streamparm = unsafe { mem::zeroed() };
        parm.type_ = BufKind::Capture.raw();
        unsafe { ioctl::g_parm(self.raw_fd(), &mut parm) }.map_err(errno("get parm"))?;
        unsafe {
            parm.parm.capture.timeperframe.numerator = interval.numerator;
            parm.parm.capture.timeperframe.denominator = interval.denominator;
        }
        unsafe { ioctl::s_parm(self.raw_fd(), &mut parm) }.map_err(errno("set parm"))?;
        let tpf = unsafe { parm.parm.capture.timeperframe };
        Ok(Fraction::new(tpf.numerator, tpf.denominator))
    }

    fn request_buffers(&self, kind: BufKind, memory: MemoryMode, count: u32) -> io::Result<u32> {
        let mut req: v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.type_ = kind.raw();
        req.memory = memory.raw();
        req.count = count;
        unsafe { ioctl::reqbufs(self.raw_fd(), &mut req) }.map_err(errno("reqbuf"))?;
        info!("{} buffers allocated, {} requested", req.count, count);
        Ok(req.count)
    }

    fn query_buffer(&self, kind: BufKind, memory: MemoryMode, index: u32) -> io::Result<BufferInfo> {
        let mut buf = Self::buffer_desc(kind, memory, index);
        unsafe { ioctl::querybuf(self.raw_fd(), &mut buf) }.map_err(errno("querybuf"))?;
        Ok(buffer_info(&buf))
    }

    fn map_buffer(&self, info: &BufferInfo) -> io::Result<MmapMut> {
        if info.mapped {
            warn!("Buffer {} is already mapped", info.index);
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        unsafe {
            MmapOptions::new()
                .offset(info.offset as u64)
                .len(info.length as usize)
                .map_mut(&self.fd)
        }
    }

    fn queue(
        &self,
        kind: BufKind,
        memory: MemoryMode,
        index: u32,
        user: Option<UserPtr>,
    ) -> io::Result<()> {
        let mut buf = Self::buffer_desc(kind, memory, index);
        buf.field = V4L2_FIELD_NONE;
        if let Some(user) = user {
            buf.m.userptr = user.addr as libc::c_ulong;
            buf.length = user.len as u32;
        }
        unsafe { ioctl::qbuf(self.raw_fd(), &mut buf) }.map_err(errno("qbuf"))?;
        Ok(())
    }

    fn dequeue(&self, kind: BufKind, memory: MemoryMode) -> io::Result<BufferInfo> {
        let mut buf = Self::buffer_desc(kind, memory, 0);
        unsafe { ioctl::dqbuf(self.raw_fd(), &mut buf) }.map_err(errno("dqbuf"))?;
        Ok(buffer_info(&buf))
    }

    #[instrument(skip(self))]
    fn stream_on(&self, kind: BufKind) -> io::Result<()> {
        let ty = kind.raw() as libc::c_int;
        unsafe { ioctl::streamon(self.raw_fd(), &ty) }.map_err(errno("stream on"))?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn stream_off(&self, kind: BufKind) -> io::Result<()> {
        let ty = kind.raw() as libc::c_int;
        unsafe { ioctl::streamoff(self.raw_fd(), &ty) }.map_err(errno("stream off"))?;
        Ok(())
    }

    fn crop(&self, kind: BufKind) -> io::Result<Rect> {
        let mut crop: v4l2_crop = unsafe { mem::zeroed() };
        crop.type_ = kind.raw();
        unsafe { ioctl::g_crop(self.raw_fd(), &mut crop) }.map_err(errno("get crop"))?;
        Ok(Rect::new(crop.c.left, crop.c.top, crop.c.width, crop.c.height))
    }

    fn set_crop(&self, kind: BufKind, rect: Rect) -> io::Result<()> {
        let mut crop: v4l2_crop = unsafe { mem::zeroed() };
        crop.type_ = kind.raw();
        crop.c.left = rect.left;
        crop.c.top = rect.top;
        crop.c.width = rect.width;
        crop.c.height = rect.height;
        unsafe { ioctl::s_crop(self.raw_fd(), &crop) }.map_err(errno("set crop"))?;
        Ok(())
    }

    fn set_rotation(&self, degrees: u32) -> io::Result<()> {
        let mut ctrl: v4l2_control = unsafe { mem::zeroed() };
        ctrl.id = V4L2_CID_ROTATE;
        ctrl.value = degrees as i32;
        unsafe { ioctl::s_ctrl(self.raw_fd(), &mut ctrl) }.map_err(errno("set rotation"))?;
        Ok(())
    }

    fn window(&self) -> io::Result<Rect> {
        let fmt = self.get_format(BufKind::Overlay)?;
        let w = unsafe { fmt.fmt.win.w };
        Ok(Rect::new(w.left, w.top, w.width, w.height))
    }

    fn set_window(&self, rect: Rect) -> io::Result<Rect> {
        let mut fmt = self.get_format(BufKind::Overlay)?;
        unsafe {
            fmt.fmt.win.w.left = rect.left;
            fmt.fmt.win.w.top = rect.top;
            fmt.fmt.win.w.width = rect.width;
            fmt.fmt.win.w.height = rect.height;
        }
        let fmt = self.apply_format(fmt)?;
        let w = unsafe { fmt.fmt.win.w };
        Ok(Rect::new(w.left, w.top, w.width, w.height))
    }

    fn set_blending(&self, blending: Blending) -> io::Result<()> {
        let mut fbuf: v4l2_framebuffer = unsafe { mem::zeroed() };
        unsafe { ioctl::g_fbuf(self.raw_fd(), &mut fbuf) }.map_err(errno("get fbuf"))?;

        fbuf.flags = blending.apply_flags(fbuf.flags);
        unsafe { ioctl::s_fbuf(self.raw_fd(), &fbuf) }.map_err(errno("set fbuf"))?;

        if blending.chroma_key.is_none() && blending.global_alpha.is_none() {
            return Ok(());
        }

        let mut fmt = self.get_format(BufKind::Overlay)?;
        unsafe {
            if let Some(key) = blending.chroma_key {
                fmt.fmt.win.chromakey = key & 0x00ff_ffff;
            }
            if let Some(alpha) = blending.global_alpha {
                fmt.fmt.win.global_alpha = alpha;
            }
        }
        self.apply_format(fmt)?;
        Ok(())
    }
}

//! Loop device attachment for the backup image

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

const LOOP_CONTROL: &str = "/dev/loop-control";

const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
const LOOP_SET_STATUS64: libc::c_ulong = 0x4C04;
const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;

const LO_FLAGS_READ_ONLY: u32 = 1;
const LO_FLAGS_AUTOCLEAR: u32 = 4;

/// `struct loop_info64` from <linux/loop.h>
#[repr(C)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; 64],
    lo_crypt_name: [u8; 64],
    lo_encrypt_key: [u8; 32],
    lo_init: [u64; 2],
}

impl LoopInfo64 {
    fn with_flags(lo_flags: u32) -> Self {
        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags,
            lo_file_name: [0; 64],
            lo_crypt_name: [0; 64],
            lo_encrypt_key: [0; 32],
            lo_init: [0; 2],
        }
    }
}

/// A loop device bound to an image file.
///
/// Attached with autoclear, so the kernel detaches it when the last mount of
/// the device goes away.
#[derive(Debug)]
pub struct LoopDevice {
    device: File,
    path: PathBuf,
}

impl LoopDevice {
    /// Bind `image` to a free loop device, read-only
    pub fn attach_read_only(image: &File) -> io::Result<Self> {
        let control = OpenOptions::new().read(true).write(true).open(LOOP_CONTROL)?;
        // SAFETY: LOOP_CTL_GET_FREE takes no argument and only returns an index
        let index = unsafe { libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE as _) };
        if index < 0 {
            return Err(io::Error::last_os_error());
        }

        let path = device_path(index);
        let device = OpenOptions::new().read(true).open(&path)?;

        // SAFETY: the image fd is valid for the duration of the call
        if unsafe { libc::ioctl(device.as_raw_fd(), LOOP_SET_FD as _, image.as_raw_fd()) } < 0 {
            return Err(io::Error::last_os_error());
        }

        let loop_dev = Self { device, path };
        let info = LoopInfo64::with_flags(LO_FLAGS_READ_ONLY | LO_FLAGS_AUTOCLEAR);
        // SAFETY: `info` is a fully initialised loop_info64 that outlives the call
        if unsafe { libc::ioctl(loop_dev.device.as_raw_fd(), LOOP_SET_STATUS64 as _, &info as *const LoopInfo64) } < 0 {
            let err = io::Error::last_os_error();
            let _ = loop_dev.detach();
            return Err(err);
        }

        Ok(loop_dev)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unbind the image explicitly
    pub fn detach(self) -> io::Result<()> {
        // SAFETY: LOOP_CLR_FD takes no argument
        if unsafe { libc::ioctl(self.device.as_raw_fd(), LOOP_CLR_FD as _) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Android keeps loop nodes under /dev/block
fn device_path(index: libc::c_int) -> PathBuf {
    let android = PathBuf::from(format!("/dev/block/loop{}", index));
    if android.exists() {
        android
    } else {
        PathBuf::from(format!("/dev/loop{}", index))
    }
}

//! # Linux TUN Device
//!
//! Layer-3 tunnel interface via /dev/net/tun. The engine reads and writes
//! whole IP packets; reads carry a one-second poll deadline so the engine's
//! stop signal is observed promptly.
//!
//! Key system calls:
//! - open("/dev/net/tun")
//! - ioctl(TUNSETIFF)
//! - poll / read / write

use std::fs::{File, OpenOptions};
use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::{AsRawFd, RawFd};

use burrow_core::TunDevice;

// from linux/if_tun.h and linux/sockios.h
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFNAMSIZ: usize = 16;
const TUNSETIFF: libc::c_ulong = 0x400454ca;
const SIOCSIFMTU: libc::c_ulong = 0x8922;
const SIOCSIFADDR: libc::c_ulong = 0x8916;
const SIOCSIFNETMASK: libc::c_ulong = 0x891c;
const SIOCGIFFLAGS: libc::c_ulong = 0x8913;
const SIOCSIFFLAGS: libc::c_ulong = 0x8914;
const IFF_UP: libc::c_short = 0x1;
const IFF_RUNNING: libc::c_short = 0x40;

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

#[repr(C)]
struct SockAddrIn {
    sin_family: libc::sa_family_t,
    sin_port: u16,
    sin_addr: libc::in_addr,
    sin_zero: [u8; 8],
}

#[repr(C)]
struct IfReqAddr {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_addr: SockAddrIn,
}

#[repr(C)]
struct IfReqMtu {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_mtu: libc::c_int,
    _pad: [u8; 20],
}

fn ifr_name(name: &str) -> io::Result<[libc::c_char; IFNAMSIZ]> {
    if name.len() >= IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("interface name too long: {}", name),
        ));
    }
    let mut out = [0 as libc::c_char; IFNAMSIZ];
    for (i, byte) in name.bytes().enumerate() {
        out[i] = byte as libc::c_char;
    }
    Ok(out)
}

/// An opened Linux TUN interface
pub struct LinuxTun {
    file: File,
    name: String,
}

impl LinuxTun {
    /// Open /dev/net/tun and attach to (or create) the named interface
    pub fn create(name: &str) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")?;

        let mut ifr = IfReq {
            ifr_name: ifr_name(name)?,
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0; 22],
        };

        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &mut ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            file,
            name: name.to_string(),
        })
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Assign an IPv4 address and the netmask implied by `prefix`
    pub fn set_address(&self, addr: Ipv4Addr, prefix: u8) -> io::Result<()> {
        let mask = if prefix == 0 {
            0u32
        } else {
            u32::MAX << (32 - prefix as u32)
        };
        self.addr_ioctl(SIOCSIFADDR, addr.octets())?;
        self.addr_ioctl(SIOCSIFNETMASK, mask.to_be_bytes())
    }

    fn addr_ioctl(&self, request: libc::c_ulong, addr: [u8; 4]) -> io::Result<()> {
        let mut ifr = IfReqAddr {
            ifr_name: ifr_name(&self.name)?,
            ifr_addr: SockAddrIn {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: 0,
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(addr),
                },
                sin_zero: [0; 8],
            },
        };
        self.ctl_ioctl(request, &mut ifr as *mut _ as *mut libc::c_void)
    }

    /// Set the interface MTU
    pub fn set_mtu(&self, mtu: i32) -> io::Result<()> {
        let mut ifr = IfReqMtu {
            ifr_name: ifr_name(&self.name)?,
            ifr_mtu: mtu,
            _pad: [0; 20],
        };
        self.ctl_ioctl(SIOCSIFMTU, &mut ifr as *mut _ as *mut libc::c_void)
    }

    /// Mark the interface up and running
    pub fn bring_up(&self) -> io::Result<()> {
        let mut ifr = IfReq {
            ifr_name: ifr_name(&self.name)?,
            ifr_flags: 0,
            _pad: [0; 22],
        };
        self.ctl_ioctl(SIOCGIFFLAGS, &mut ifr as *mut _ as *mut libc::c_void)?;
        ifr.ifr_flags |= IFF_UP | IFF_RUNNING;
        self.ctl_ioctl(SIOCSIFFLAGS, &mut ifr as *mut _ as *mut libc::c_void)
    }

    /// Interface ioctls go through a throwaway AF_INET socket
    fn ctl_ioctl(&self, request: libc::c_ulong, arg: *mut libc::c_void) -> io::Result<()> {
        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if sock < 0 {
            return Err(io::Error::last_os_error());
        }
        let ret = unsafe { libc::ioctl(sock, request, arg) };
        let err = io::Error::last_os_error();
        unsafe { libc::close(sock) };
        if ret < 0 {
            return Err(err);
        }
        Ok(())
    }
}

impl TunDevice for LinuxTun {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pfd = libc::pollfd {
            fd: self.fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut pfd, 1, 1000) };
        if ready < 0 {
            return Err(io::Error::last_os_error());
        }
        if ready == 0 {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "tun read timeout"));
        }

        let n = unsafe { libc::read(self.fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn write(&self, packet: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::write(
                self.fd(),
                packet.as_ptr() as *const libc::c_void,
                packet.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn is_up(&self) -> io::Result<bool> {
        let mut ifr = IfReq {
            ifr_name: ifr_name(&self.name)?,
            ifr_flags: 0,
            _pad: [0; 22],
        };
        self.ctl_ioctl(SIOCGIFFLAGS, &mut ifr as *mut _ as *mut libc::c_void)?;
        Ok(ifr.ifr_flags & IFF_UP != 0)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

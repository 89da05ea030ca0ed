use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

/// Framing of what the device reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceMode {
    /// Bare IP packets.
    #[default]
    Tun,
    /// Ethernet frames.
    Tap,
}

impl DeviceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceMode::Tun => "tun",
            DeviceMode::Tap => "tap",
        }
    }
}

/// 虚拟网卡抽象：一次读写一个完整 IP 包（TAP 模式下是一个以太网帧）
#[async_trait]
pub trait TunDevice: Send + Sync {
    fn name(&self) -> &str;

    fn mtu(&self) -> u32;

    fn mode(&self) -> DeviceMode {
        DeviceMode::Tun
    }

    /// 读取一个 IP 包
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize>;

    /// 写入一个 IP 包
    async fn write_packet(&self, buf: &[u8]) -> Result<usize>;
}

/// Options for attaching to the interface.
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub name: String,
    /// `/proc/<pid>/ns/net` style path; current namespace when `None`.
    pub netns: Option<String>,
    /// Skip the `SIOCGIFMTU` query and use this value.
    pub mtu: Option<u32>,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            name: "tun0".to_string(),
            netns: None,
            mtu: None,
        }
    }
}

pub fn open_device(options: &DeviceOptions) -> Result<Box<dyn TunDevice>> {
    #[cfg(target_os = "linux")]
    {
        return Ok(Box::new(linux::LinuxTunDevice::open(options)?));
    }

    #[allow(unreachable_code)]
    {
        let _ = options;
        Err(crate::common::GatewayError::Unsupported(
            "tun devices are only supported on linux".into(),
        )
        .into())
    }
}

#[cfg(target_os = "linux")]
pub mod linux {
    use std::ffi::CString;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use tokio::io::unix::AsyncFd;
    use tracing::{debug, info};

    use super::{DeviceMode, DeviceOptions, TunDevice};
    use crate::common::GatewayError;

    const TUN_DEVICE_PATH: &str = "/dev/net/tun";
    const IFNAMSIZ: usize = 16;

    const IFF_TUN: i16 = 0x0001;
    const IFF_TAP: i16 = 0x0002;
    const IFF_NO_PI: i16 = 0x1000;

    const TUNSETIFF: u64 = 0x400454CA;
    const TUNGETIFF: u64 = 0x800454D2;
    const SIOCGIFMTU: u64 = 0x8921;

    const DEFAULT_MTU: u32 = 1500;

    #[repr(C)]
    struct IfReq {
        name: [u8; IFNAMSIZ],
        // ifr_flags / ifr_mtu 共用这块空间
        data: [u8; 24],
    }

    impl IfReq {
        fn new(name: &str) -> Result<Self> {
            if name.is_empty() || name.len() >= IFNAMSIZ {
                return Err(GatewayError::Setup(format!("invalid interface name '{}'", name)).into());
            }
            let mut req = IfReq {
                name: [0u8; IFNAMSIZ],
                data: [0u8; 24],
            };
            req.name[..name.len()].copy_from_slice(name.as_bytes());
            Ok(req)
        }

        fn flags(&self) -> i16 {
            i16::from_ne_bytes([self.data[0], self.data[1]])
        }

        fn set_flags(&mut self, flags: i16) {
            self.data[..2].copy_from_slice(&flags.to_ne_bytes());
        }

        fn mtu(&self) -> i32 {
            i32::from_ne_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
        }
    }

    /// `/dev/net/tun` queue attached with `IFF_NO_PI` in whichever of
    /// TUN or TAP mode the interface was created with.
    pub struct LinuxTunDevice {
        name: String,
        mtu: u32,
        mode: DeviceMode,
        fd: AsyncFd<OwnedFd>,
    }

    struct Attached {
        fd: OwnedFd,
        mtu: u32,
        mode: DeviceMode,
    }

    impl LinuxTunDevice {
        pub fn open(options: &DeviceOptions) -> Result<Self> {
            let Attached {
                fd,
                mtu: queried_mtu,
                mode,
            } = match &options.netns {
                Some(path) => open_in_netns(path, &options.name)?,
                None => attach(&options.name)?,
            };
            let mtu = options.mtu.unwrap_or(queried_mtu);

            let fd = AsyncFd::new(fd).context("failed to register tun fd with the reactor")?;
            info!(
                interface = %options.name,
                netns = options.netns.as_deref().unwrap_or("-"),
                mtu,
                mode = mode.as_str(),
                "tun device attached"
            );
            Ok(Self {
                name: options.name.clone(),
                mtu,
                mode,
                fd,
            })
        }
    }

    /// setns() changes the namespace of the calling thread only, so the
    /// device is opened on a throwaway thread. The fd stays bound to the
    /// interface of that namespace.
    fn open_in_netns(path: &str, name: &str) -> Result<Attached> {
        let path = path.to_string();
        let name = name.to_string();
        std::thread::Builder::new()
            .name("nsgate-netns".into())
            .spawn(move || -> Result<Attached> {
                let ns = std::fs::File::open(&path)
                    .map_err(|e| GatewayError::Setup(format!("open netns '{}': {}", path, e)))?;
                let ret = unsafe { libc::setns(ns.as_raw_fd(), libc::CLONE_NEWNET) };
                if ret < 0 {
                    let err = io::Error::last_os_error();
                    return Err(GatewayError::Setup(format!("setns('{}'): {}", path, err)).into());
                }
                debug!(netns = %path, "entered network namespace");
                attach(&name)
            })
            .context("failed to spawn netns thread")?
            .join()
            .map_err(|_| anyhow::anyhow!("netns thread panicked"))?
    }

    fn attach(name: &str) -> Result<Attached> {
        let path = CString::new(TUN_DEVICE_PATH)?;
        let raw = unsafe {
            libc::open(
                path.as_ptr(),
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if raw < 0 {
            let err = io::Error::last_os_error();
            return Err(GatewayError::Setup(format!("open({}): {}", TUN_DEVICE_PATH, err)).into());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // 已存在的 TAP 接口用 IFF_TUN 绑定会返回 EINVAL
        let mode = match set_iff(&fd, IfReq::new(name)?, IFF_TUN | IFF_NO_PI) {
            Ok(()) => DeviceMode::Tun,
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                debug!(interface = name, "TUN attach refused, retrying as TAP");
                set_iff(&fd, IfReq::new(name)?, IFF_TAP | IFF_NO_PI).map_err(|err| {
                    GatewayError::Setup(format!("ioctl(TUNSETIFF, {}): {}", name, err))
                })?;
                DeviceMode::Tap
            }
            Err(err) => {
                return Err(
                    GatewayError::Setup(format!("ioctl(TUNSETIFF, {}): {}", name, err)).into(),
                )
            }
        };

        let mut got = IfReq::new(name)?;
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), TUNGETIFF as _, &mut got) };
        let mode = if ret == 0 { mode_from_flags(got.flags()) } else { mode };

        Ok(Attached {
            fd,
            mtu: query_mtu(name),
            mode,
        })
    }

    fn set_iff(fd: &OwnedFd, mut req: IfReq, flags: i16) -> io::Result<()> {
        req.set_flags(flags);
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF as _, &mut req) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn mode_from_flags(flags: i16) -> DeviceMode {
        if flags & IFF_TAP != 0 {
            DeviceMode::Tap
        } else {
            DeviceMode::Tun
        }
    }

    fn query_mtu(name: &str) -> u32 {
        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
        if sock < 0 {
            return DEFAULT_MTU;
        }
        let sock = unsafe { OwnedFd::from_raw_fd(sock) };

        let Ok(mut req) = IfReq::new(name) else {
            return DEFAULT_MTU;
        };
        let ret = unsafe { libc::ioctl(sock.as_raw_fd(), SIOCGIFMTU as _, &mut req) };
        if ret < 0 || req.mtu() <= 0 {
            debug!(interface = name, error = %io::Error::last_os_error(), "SIOCGIFMTU failed");
            return DEFAULT_MTU;
        }
        req.mtu() as u32
    }

    #[async_trait]
    impl TunDevice for LinuxTunDevice {
        fn name(&self) -> &str {
            &self.name
        }

        fn mtu(&self) -> u32 {
            self.mtu
        }

        fn mode(&self) -> DeviceMode {
            self.mode
        }

        async fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
            loop {
                let mut guard = self.fd.readable().await?;
                let res = guard.try_io(|fd| {
                    let n = unsafe {
                        libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
                    };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                });
                match res {
                    Ok(result) => return Ok(result?),
                    Err(_would_block) => continue,
                }
            }
        }

        async fn write_packet(&self, buf: &[u8]) -> Result<usize> {
            loop {
                let mut guard = self.fd.writable().await?;
                let res = guard.try_io(|fd| {
                    let n = unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                });
                match res {
                    Ok(result) => return Ok(result?),
                    Err(_would_block) => continue,
                }
            }
        }
    }

}

/// In-memory device for tests and embedding: packets written by the
/// stack come out of [`DeviceHandle::outbound`], packets sent into
/// [`DeviceHandle::inbound`] are read by the stack.
pub struct ChannelDevice {
    name: String,
    mtu: u32,
    mode: DeviceMode,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    tx: mpsc::Sender<Vec<u8>>,
}

pub struct DeviceHandle {
    pub inbound: mpsc::Sender<Vec<u8>>,
    pub outbound: mpsc::Receiver<Vec<u8>>,
}

impl ChannelDevice {
    pub fn pair(name: &str, mtu: u32) -> (Self, DeviceHandle) {
        Self::with_mode(name, mtu, DeviceMode::Tun)
    }

    /// Device that carries Ethernet frames, like a TAP interface.
    pub fn pair_tap(name: &str, mtu: u32) -> (Self, DeviceHandle) {
        Self::with_mode(name, mtu, DeviceMode::Tap)
    }

    pub fn with_mode(name: &str, mtu: u32, mode: DeviceMode) -> (Self, DeviceHandle) {
        let (in_tx, in_rx) = mpsc::channel(256);
        let (out_tx, out_rx) = mpsc::channel(256);
        let device = Self {
            name: name.to_string(),
            mtu,
            mode,
            rx: Mutex::new(in_rx),
            tx: out_tx,
        };
        let handle = DeviceHandle {
            inbound: in_tx,
            outbound: out_rx,
        };
        (device, handle)
    }
}

#[async_trait]
impl TunDevice for ChannelDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u32 {
        self.mtu
    }

    fn mode(&self) -> DeviceMode {
        self.mode
    }

    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        let packet = match self.rx.lock().await.recv().await {
            Some(p) => p,
            // 对端已关闭，不再有数据
            None => std::future::pending().await,
        };
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }

    async fn write_packet(&self, buf: &[u8]) -> Result<usize> {
        self.tx
            .send(buf.to_vec())
            .await
            .map_err(|_| anyhow::anyhow!("channel device closed"))?;
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_device_moves_packets() {
        let (device, mut handle) = ChannelDevice::pair("test0", 1500);
        assert_eq!(device.name(), "test0");
        assert_eq!(device.mtu(), 1500);
        assert_eq!(device.mode(), DeviceMode::Tun);

        handle.inbound.send(vec![1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 16];
        let n = device.read_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);

        device.write_packet(&[9, 9]).await.unwrap();
        assert_eq!(handle.outbound.recv().await.unwrap(), vec![9, 9]);
    }

    #[test]
    fn tap_pair_reports_tap_mode() {
        let (device, _handle) = ChannelDevice::pair_tap("tap0", 1500);
        assert_eq!(device.mode(), DeviceMode::Tap);
    }
}

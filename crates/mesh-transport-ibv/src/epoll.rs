//! 套接字就绪事件多路复用循环。
//!
//! # 模块定位（Why）
//! - 建连/监听状态机需要在不绑定任何异步运行时的前提下感知描述符就绪；
//!   本模块提供一条专属线程，统一轮询所有注册的描述符并回调处理器。
//! - 注册表只在循环线程上被读写：任意线程发起的注册/注销都先进入命令队列、
//!   经 eventfd 唤醒循环后在轮询周期之间生效，天然与轮询序列化。
//!
//! # 契约（What）
//! - `register`/`unregister` 可从任意线程调用，非阻塞；
//! - `unregister` 幂等：目标不在表中（或注销尚未生效）时为空操作；
//! - 注销生效后处理器绝不再被回调；
//! - `close` 非阻塞、幂等、并发安全；`join` 阻塞直到线程退出。

use std::collections::{HashMap, VecDeque};
use std::io;
use std::ops::BitOr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::raw::c_void;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use parking_lot::Mutex;

use crate::error;

/// 单次 `epoll_wait` 取回的事件上限。
const EVENT_BATCH: usize = 64;

/// 描述符订阅/上报的事件集合。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(0b001);
    pub const WRITABLE: Interest = Interest(0b010);
    pub const ERROR: Interest = Interest(0b100);

    /// 是否包含 `other` 的全部位。
    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn to_epoll(self) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if self.contains(Self::READABLE) {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.contains(Self::WRITABLE) {
            flags |= EpollFlags::EPOLLOUT;
        }
        // 错误与挂断无须显式订阅，内核总会上报。
        flags
    }

    fn from_epoll(flags: EpollFlags) -> Self {
        let mut interest = Self::NONE;
        if flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI) {
            interest = interest | Self::READABLE;
        }
        if flags.contains(EpollFlags::EPOLLOUT) {
            interest = interest | Self::WRITABLE;
        }
        if flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
            interest = interest | Self::ERROR;
        }
        interest
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// 描述符就绪事件的处理器，由循环线程回调。
pub trait EventHandler: Send + Sync {
    /// `interest` 为本次实际就绪的事件集合。
    fn on_events(&self, interest: Interest);
}

enum Command {
    Register {
        fd: RawFd,
        interest: Interest,
        handler: Arc<dyn EventHandler>,
    },
    Unregister {
        fd: RawFd,
    },
}

/// eventfd 唤醒句柄：跨线程向阻塞中的 `epoll_wait` 递送一次唤醒。
struct WakeupFd(OwnedFd);

impl WakeupFd {
    fn new() -> io::Result<Self> {
        let fd = unsafe {
            nix::libc::eventfd(0, nix::libc::EFD_CLOEXEC | nix::libc::EFD_NONBLOCK)
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    fn raw(&self) -> RawFd {
        self.0.as_raw_fd()
    }

    fn notify(&self) {
        let value: u64 = 1;
        // EAGAIN 表示计数器已满，唤醒本就处于待决状态，可安全忽略。
        unsafe {
            nix::libc::write(
                self.0.as_raw_fd(),
                (&raw const value).cast::<c_void>(),
                size_of::<u64>(),
            );
        }
    }

    fn drain(&self) {
        let mut value: u64 = 0;
        unsafe {
            nix::libc::read(
                self.0.as_raw_fd(),
                (&raw mut value).cast::<c_void>(),
                size_of::<u64>(),
            );
        }
    }
}

struct LoopShared {
    epoll: Epoll,
    wakeup: WakeupFd,
    commands: Mutex<VecDeque<Command>>,
    closed: AtomicBool,
}

/// 拥有一条专属线程的 epoll 多路复用循环。
pub struct EpollLoop {
    shared: Arc<LoopShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EpollLoop {
    /// 创建循环并立即启动轮询线程。
    pub fn new() -> io::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
        let wakeup = WakeupFd::new()?;
        epoll
            .add(
                wakeup.0.as_fd(),
                EpollEvent::new(EpollFlags::EPOLLIN, wakeup.raw() as u64),
            )
            .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;

        let shared = Arc::new(LoopShared {
            epoll,
            wakeup,
            commands: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        });

        let thread = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("mesh-ibv-epoll".into())
                .spawn(move || run(&shared))?
        };

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// 注册描述符；处理器将在循环线程上被回调。
    pub fn register(&self, fd: RawFd, interest: Interest, handler: Arc<dyn EventHandler>) {
        self.submit(Command::Register {
            fd,
            interest,
            handler,
        });
    }

    /// 注销描述符；幂等，可对已移除或从未注册的描述符调用。
    pub fn unregister(&self, fd: RawFd) {
        self.submit(Command::Unregister { fd });
    }

    fn submit(&self, command: Command) {
        if self.shared.closed.load(Ordering::Acquire) {
            tracing::debug!("epoll 循环已关闭，注册变更被丢弃");
            return;
        }
        self.shared.commands.lock().push_back(command);
        self.shared.wakeup.notify();
    }

    /// 请求循环退出；非阻塞、幂等、并发安全。
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.wakeup.notify();
    }

    /// 阻塞等待轮询线程退出；重复调用为空操作。
    pub fn join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("epoll 多路复用线程以 panic 结束");
            }
        }
    }
}

fn run(shared: &LoopShared) {
    // 注册表由循环线程独占，注册变更经命令队列进入，与轮询天然串行。
    let mut handlers: HashMap<RawFd, Arc<dyn EventHandler>> = HashMap::new();
    let mut events = [EpollEvent::empty(); EVENT_BATCH];

    loop {
        drain_commands(shared, &mut handlers);
        if shared.closed.load(Ordering::Acquire) {
            break;
        }

        let count = match shared.epoll.wait(&mut events, EpollTimeout::NONE) {
            Ok(count) => count,
            Err(Errno::EINTR) => continue,
            Err(errno) => {
                tracing::error!(%errno, "epoll_wait 失败，多路复用循环退出");
                break;
            }
        };

        // 事件分发前再排空一次命令：与就绪事件同批到达的注销必须先生效，
        // 滞后事件随之在查表阶段被丢弃。
        drain_commands(shared, &mut handlers);

        for event in &events[..count] {
            let fd = event.data() as RawFd;
            if fd == shared.wakeup.raw() {
                shared.wakeup.drain();
                continue;
            }
            let Some(handler) = handlers.get(&fd).map(Arc::clone) else {
                continue;
            };
            handler.on_events(Interest::from_epoll(event.events()));
        }
    }
    tracing::debug!("epoll 多路复用线程退出");
}

fn drain_commands(shared: &LoopShared, handlers: &mut HashMap<RawFd, Arc<dyn EventHandler>>) {
    let pending = std::mem::take(&mut *shared.commands.lock());
    for command in pending {
        apply(shared, handlers, command);
    }
}

fn apply(
    shared: &LoopShared,
    handlers: &mut HashMap<RawFd, Arc<dyn EventHandler>>,
    command: Command,
) {
    match command {
        Command::Register {
            fd,
            interest,
            handler,
        } => {
            let mut event = EpollEvent::new(interest.to_epoll(), fd as u64);
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            let outcome = if handlers.contains_key(&fd) {
                shared.epoll.modify(borrowed, &mut event)
            } else {
                shared.epoll.add(borrowed, event)
            };
            match outcome {
                Ok(()) => {
                    handlers.insert(fd, handler);
                }
                Err(errno) => {
                    tracing::warn!(fd, %errno, code = error::EPOLL_CTL.code, "描述符注册失败");
                }
            }
        }
        Command::Unregister { fd } => {
            if handlers.remove(&fd).is_some() {
                let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                if let Err(errno) = shared.epoll.delete(borrowed) {
                    // 持有者可能已先行关闭描述符，幂等语义下仅留诊断。
                    tracing::debug!(fd, %errno, "epoll 注销时内核已不识别该描述符");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 事件集合的包含与并集运算必须按位生效。
    #[test]
    fn interest_bit_operations() {
        let combined = Interest::READABLE | Interest::ERROR;
        assert!(combined.contains(Interest::READABLE));
        assert!(combined.contains(Interest::ERROR));
        assert!(!combined.contains(Interest::WRITABLE));
        assert!(Interest::NONE.is_empty());
    }

    /// 内核标志到事件集合的映射：错误与挂断折叠为 ERROR。
    #[test]
    fn epoll_flags_fold_into_interest() {
        let interest =
            Interest::from_epoll(EpollFlags::EPOLLIN | EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP);
        assert!(interest.contains(Interest::READABLE));
        assert!(interest.contains(Interest::ERROR));
        assert!(!interest.contains(Interest::WRITABLE));
    }

    /// 订阅集合不会把错误位下发给内核（内核总会上报）。
    #[test]
    fn error_interest_is_not_subscribed_explicitly() {
        assert_eq!(Interest::ERROR.to_epoll(), EpollFlags::empty());
        assert_eq!(
            (Interest::READABLE | Interest::ERROR).to_epoll(),
            EpollFlags::EPOLLIN
        );
    }
}

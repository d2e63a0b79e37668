//! epoll 多路复用循环的场景测试。
//!
//! # 教案级导览
//!
//! - **Why**：循环是建连/监听状态机感知就绪事件的唯一通道，注册变更与
//!   轮询之间的序列化语义（尤其是注销后绝不回调）必须可验证。
//! - **How**：用 `UnixStream` 对构造真实描述符，处理器以原子计数器记录
//!   回调次数；断言统一采用“轮询 + 截止时间”的方式等待异步效果。

use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use mesh_transport_ibv::epoll::{EpollLoop, EventHandler, Interest};

#[derive(Default)]
struct CountingHandler {
    readable: AtomicUsize,
}

impl EventHandler for CountingHandler {
    fn on_events(&self, interest: Interest) {
        if interest.contains(Interest::READABLE) {
            self.readable.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn wait_until(deadline: Duration, mut ready: impl FnMut() -> bool) -> bool {
    let limit = Instant::now() + deadline;
    while Instant::now() < limit {
        if ready() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    ready()
}

/// 写入一字节后，注册在读端的处理器必须在循环线程上被回调。
#[test]
fn readable_descriptor_invokes_handler() {
    let looper = EpollLoop::new().expect("创建 epoll 循环");
    let (mut writer, reader) = UnixStream::pair().expect("创建套接字对");
    let handler = Arc::new(CountingHandler::default());

    looper.register(reader.as_raw_fd(), Interest::READABLE, handler.clone());
    writer.write_all(b"x").expect("写入触发字节");

    assert!(
        wait_until(Duration::from_secs(2), || {
            handler.readable.load(Ordering::SeqCst) > 0
        }),
        "就绪事件必须在限期内送达处理器"
    );

    // 数据未被读走，水平触发会反复上报；先注销再停机。
    looper.unregister(reader.as_raw_fd());
    looper.close();
    looper.join();
}

/// 注册后立即注销：其后到达的就绪事件不得触发任何回调。
#[test]
fn unregister_before_readiness_suppresses_handler() {
    let looper = EpollLoop::new().expect("创建 epoll 循环");
    let (mut writer, reader) = UnixStream::pair().expect("创建套接字对");
    let handler = Arc::new(CountingHandler::default());

    looper.register(reader.as_raw_fd(), Interest::READABLE, handler.clone());
    looper.unregister(reader.as_raw_fd());
    writer.write_all(b"x").expect("写入触发字节");

    thread::sleep(Duration::from_millis(100));
    assert_eq!(
        handler.readable.load(Ordering::SeqCst),
        0,
        "注销生效后处理器绝不能被回调"
    );

    // 对已移除的描述符重复注销：幂等空操作。
    looper.unregister(reader.as_raw_fd());
    looper.close();
    looper.join();
}

/// close 幂等且非阻塞；join 可重复调用并立即返回。
#[test]
fn close_and_join_are_idempotent() {
    let looper = Arc::new(EpollLoop::new().expect("创建 epoll 循环"));

    let closers: Vec<_> = (0..2)
        .map(|_| {
            let looper = Arc::clone(&looper);
            thread::spawn(move || looper.close())
        })
        .collect();
    for handle in closers {
        handle.join().expect("close 线程不应 panic");
    }

    looper.join();
    let started = Instant::now();
    looper.join();
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "重复 join 必须立即返回"
    );
}

/// 循环关闭后的注册变更被安全丢弃，不得崩溃。
#[test]
fn registration_after_close_is_discarded() {
    let looper = EpollLoop::new().expect("创建 epoll 循环");
    let (_writer, reader) = UnixStream::pair().expect("创建套接字对");

    looper.close();
    looper.join();
    looper.register(
        reader.as_raw_fd(),
        Interest::READABLE,
        Arc::new(CountingHandler::default()),
    );
    looper.unregister(reader.as_raw_fd());
}

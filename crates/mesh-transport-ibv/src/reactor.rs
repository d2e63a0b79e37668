//! 硬件完成事件反应器。
//!
//! # 模块定位（Why）
//! - verbs 硬件把完成的异步操作写入完成队列，队列只能轮询、不能像描述符那样
//!   交给 epoll；本模块为此提供第二条专属线程，轮询完成队列并分发给按队列对
//!   编号注册的处理器。
//! - 同一条线程还负责排空延迟任务队列：这是其它线程触碰反应器约束状态的
//!   唯一通道（见 [`crate::defer`]）。
//!
//! # 设计要点（How）
//! - **忙轮询 + 驻留**：有进展时保持紧循环压低完成延迟；连续空转超过阈值后
//!   驻留在任务队列的条件变量上，由新任务或关闭信号唤醒，避免空烧 CPU。
//! - **线程约束**：队列对注册表只允许反应器线程写入（debug 断言兜底），
//!   其它线程一律经 `defer` 间接操作。
//! - **资源编排**：完成队列先于设备上下文析构、设备上下文先于设备列表与
//!   驱动库析构，全部由资源结构体的字段顺序保证。

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;

use crate::defer::{Task, TaskQueue};
use crate::error;
use crate::verbs::{
    COMPLETION_POLL_BATCH, COMPLETION_QUEUE_DEPTH, CompletionQueue, DeviceContext, DeviceList,
    VerbsLibrary, ffi,
};

/// 连续空转多少轮后进入驻留。
const BUSY_SPIN_LIMIT: u32 = 1024;

/// 驻留超时：即便无人唤醒也周期性回到轮询，保持完成延迟有界。
const PARK_TIMEOUT: Duration = Duration::from_millis(50);

/// 一条硬件完成记录的只读视图。
#[derive(Clone, Copy)]
pub struct WorkCompletion {
    raw: ffi::ibv_wc,
}

impl WorkCompletion {
    /// 提交方附带的工作请求标识。
    pub fn wr_id(&self) -> u64 {
        self.raw.wr_id
    }

    /// 产生该完成记录的队列对编号。
    pub fn qp_num(&self) -> u32 {
        self.raw.qp_num
    }

    /// 本次操作传输的字节数。
    pub fn byte_len(&self) -> u32 {
        self.raw.byte_len
    }

    /// 完成的操作类别（发送、接收、RDMA 写等），原始编码。
    pub fn opcode(&self) -> i32 {
        self.raw.opcode
    }

    /// 对端随写操作捎带的立即数，协作者用它承载轻量通知。
    pub fn immediate_data(&self) -> u32 {
        self.raw.imm_data
    }

    /// 操作是否成功完成。
    pub fn is_success(&self) -> bool {
        self.raw.status == ffi::IBV_WC_SUCCESS
    }

    /// 原始完成状态码，失败时用于诊断。
    pub fn status_code(&self) -> i32 {
        self.raw.status
    }
}

/// 队列对完成事件的处理器，由反应器线程回调。
pub trait CompletionHandler: Send + Sync {
    fn on_completion(&self, completion: &WorkCompletion);
}

struct ReactorShared {
    queue: TaskQueue,
    handlers: Mutex<HashMap<u32, Arc<dyn CompletionHandler>>>,
    loop_thread: OnceLock<ThreadId>,
}

/// 硬件资源包；字段顺序即析构顺序。
struct ReactorResources {
    cq: CompletionQueue,
    _device: DeviceContext,
    _devices: DeviceList,
    _lib: Arc<VerbsLibrary>,
}

/// 拥有一条专属线程的完成事件反应器。
pub struct Reactor {
    shared: Arc<ReactorShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    /// 绑定探测到的设备并启动反应器线程。
    ///
    /// # 契约（What）
    /// - `devices` 必须非空（探测层保证）；打开首个设备并在其上建立完成队列；
    /// - 探测已通过却仍初始化失败，说明主机配置真实损坏：直接按致命故障
    ///   终止进程，不再返回错误。
    pub(crate) fn new(lib: Arc<VerbsLibrary>, devices: DeviceList) -> Self {
        let Some(device) = devices.get(0) else {
            error::fatal(
                error::OPEN_DEVICE,
                io::Error::other("探测通过但设备列表为空"),
            );
        };
        let device_context = DeviceContext::open(&lib, device)
            .unwrap_or_else(|err| error::fatal(error::OPEN_DEVICE, err));
        let cq = device_context
            .create_completion_queue(COMPLETION_QUEUE_DEPTH)
            .unwrap_or_else(|err| error::fatal(error::CREATE_CQ, err));
        let resources = ReactorResources {
            cq,
            _device: device_context,
            _devices: devices,
            _lib: lib,
        };

        let shared = Arc::new(ReactorShared {
            queue: TaskQueue::new(),
            handlers: Mutex::new(HashMap::new()),
            loop_thread: OnceLock::new(),
        });

        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("mesh-ibv-reactor".into())
                .spawn(move || run(&shared, &resources))
                .unwrap_or_else(|err| error::fatal(error::THREAD_SPAWN, err))
        };

        Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// 把任务投递到反应器线程执行。
    ///
    /// # 契约（What）
    /// - 非阻塞；FIFO；每个任务至多执行一次，线程存活期间恰好一次；
    /// - 即便调用方就是反应器线程本身也不会内联执行，杜绝重入死锁；
    /// - 关闭后的投递被安全丢弃。
    pub fn defer(&self, task: Task) {
        self.shared.queue.push(task);
    }

    /// 当前线程是否就是反应器线程。
    pub fn in_loop(&self) -> bool {
        self.shared.loop_thread.get().copied() == Some(thread::current().id())
    }

    /// 注册队列对完成处理器；只允许在反应器线程上调用。
    pub fn register_queue_pair(&self, qp_num: u32, handler: Arc<dyn CompletionHandler>) {
        debug_assert!(self.in_loop(), "队列对注册必须经 defer 移交到反应器线程");
        self.shared.handlers.lock().insert(qp_num, handler);
    }

    /// 注销队列对完成处理器；幂等，只允许在反应器线程上调用。
    pub fn unregister_queue_pair(&self, qp_num: u32) {
        debug_assert!(self.in_loop(), "队列对注销必须经 defer 移交到反应器线程");
        self.shared.handlers.lock().remove(&qp_num);
    }

    /// 请求反应器退出；非阻塞、幂等、并发安全。
    pub fn close(&self) {
        self.shared.queue.close();
    }

    /// 阻塞等待反应器线程退出；重复调用为空操作。
    pub fn join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("反应器线程以 panic 结束");
            }
        }
    }
}

fn run(shared: &Arc<ReactorShared>, resources: &ReactorResources) {
    let _ = shared.loop_thread.set(thread::current().id());
    let mut completions = [ffi::ibv_wc::default(); COMPLETION_POLL_BATCH];
    let mut idle_spins: u32 = 0;

    loop {
        let mut progress = false;

        match resources.cq.poll(&mut completions) {
            Ok(0) => {}
            Ok(count) => {
                progress = true;
                dispatch(shared, &completions[..count]);
            }
            Err(err) => {
                tracing::error!(error = %err, "完成队列轮询失败，反应器线程退出");
                shared.queue.close();
                break;
            }
        }

        let batch = shared.queue.take_batch();
        if !batch.is_empty() {
            progress = true;
            for task in batch {
                task();
            }
        }

        if shared.queue.is_closed() {
            // 关闭前完成最后一次排空：已接收的任务要么执行完毕、要么
            // 在 push 侧就被拒绝，绝不会在线程退出后再被执行。
            for task in shared.queue.take_batch() {
                task();
            }
            break;
        }

        if progress {
            idle_spins = 0;
            continue;
        }
        idle_spins += 1;
        if idle_spins >= BUSY_SPIN_LIMIT {
            shared.queue.park(PARK_TIMEOUT);
            idle_spins = 0;
        }
    }
    tracing::debug!("反应器线程退出");
}

fn dispatch(shared: &ReactorShared, completions: &[ffi::ibv_wc]) {
    for raw in completions {
        let completion = WorkCompletion { raw: *raw };
        let handler = shared
            .handlers
            .lock()
            .get(&completion.qp_num())
            .map(Arc::clone);
        match handler {
            Some(handler) => handler.on_completion(&completion),
            None => {
                // 队列对可能刚被注销，滞后的完成记录按约定丢弃。
                tracing::debug!(qp_num = completion.qp_num(), "完成记录没有对应处理器");
            }
        }
    }
}

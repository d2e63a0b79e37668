//! 跨线程延迟执行队列。
//!
//! # 模块定位（Why）
//! - 反应器线程独占其硬件完成状态；其它线程想要触碰这些状态，唯一的同步
//!   手段就是把工作投递进本队列、由反应器线程代为执行。
//! - 队列语义刻意收紧：FIFO、每个任务至多执行一次、绝不在投递线程上内联
//!   执行——即便投递方恰好就是拥有线程本身，也必须排队，避免重入死锁。
//!
//! # 契约（What）
//! - `push` 非阻塞；队列关闭后投递的任务被直接丢弃（析构但不执行）；
//! - `take_batch` 一次取走当前全部任务，调用方在锁外按序执行；
//! - `park` 供拥有线程在空转后休眠，任务到达或关闭时被唤醒。

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// 零参一次性任务，所有权随投递转移。
pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct QueueState {
    tasks: VecDeque<Task>,
    closed: bool,
}

/// 无界线程安全任务队列，由唯一的拥有线程负责排空。
pub struct TaskQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// 投递一个任务；返回是否已被队列接收。
    ///
    /// 队列关闭后任务被丢弃并返回 `false`，任务析构但绝不执行。
    pub fn push(&self, task: Task) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            tracing::debug!("任务投递发生在队列关闭之后，已丢弃");
            return false;
        }
        state.tasks.push_back(task);
        drop(state);
        self.ready.notify_one();
        true
    }

    /// 取走当前积压的全部任务，保持投递顺序。
    ///
    /// 在锁外执行取走的任务，避免执行期间阻塞新的投递。
    pub fn take_batch(&self) -> VecDeque<Task> {
        let mut state = self.state.lock();
        std::mem::take(&mut state.tasks)
    }

    /// 拥有线程空转后的休眠点：等待新任务、关闭信号或超时。
    pub fn park(&self, timeout: Duration) {
        let mut state = self.state.lock();
        if !state.tasks.is_empty() || state.closed {
            return;
        }
        let _ = self.ready.wait_for(&mut state, timeout);
    }

    /// 关闭队列并唤醒休眠中的拥有线程；幂等。
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.ready.notify_all();
    }

    /// 队列是否已关闭。
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    /// ## FIFO 顺序
    ///
    /// - **意图 (Why)**：延迟任务之间常存在先后依赖（先注册、后激活），
    ///   顺序颠倒会让上层状态机观察到中间态。
    /// - **逻辑 (How)**：单线程投递带序号的任务，排空后校验执行序列。
    #[test]
    fn tasks_drain_in_fifo_order() {
        let queue = TaskQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for index in 0..8usize {
            let seen = Arc::clone(&seen);
            queue.push(Box::new(move || seen.lock().push(index)));
        }
        for task in queue.take_batch() {
            task();
        }
        assert_eq!(*seen.lock(), (0..8).collect::<Vec<_>>(), "执行顺序必须与投递顺序一致");
    }

    /// ## 多线程投递、恰好一次执行
    ///
    /// - **意图 (Why)**：队列是反应器对外的唯一同步原语，任何重复执行或
    ///   丢失都会直接破坏上层不变量。
    /// - **逻辑 (How)**：八个投递线程各投递若干计数任务，一个排空线程模拟
    ///   拥有线程循环执行；最终计数必须恰好等于投递总数。
    #[test]
    fn concurrent_submission_executes_exactly_once() {
        const SUBMITTERS: usize = 8;
        const PER_THREAD: usize = 64;

        let queue = Arc::new(TaskQueue::new());
        let executed = Arc::new(AtomicUsize::new(0));

        let drainer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                loop {
                    let batch = queue.take_batch();
                    let drained = !batch.is_empty();
                    for task in batch {
                        task();
                    }
                    if queue.is_closed() && !drained {
                        // 关闭后再完整排空一次，保证已接收任务不丢失。
                        for task in queue.take_batch() {
                            task();
                        }
                        break;
                    }
                    queue.park(Duration::from_millis(10));
                }
            })
        };

        let submitters: Vec<_> = (0..SUBMITTERS)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let executed = Arc::clone(&executed);
                thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        let executed = Arc::clone(&executed);
                        assert!(
                            queue.push(Box::new(move || {
                                executed.fetch_add(1, Ordering::SeqCst);
                            })),
                            "队列关闭前的投递必须被接收"
                        );
                    }
                })
            })
            .collect();

        for handle in submitters {
            handle.join().expect("投递线程不应 panic");
        }
        queue.close();
        drainer.join().expect("排空线程不应 panic");

        assert_eq!(
            executed.load(Ordering::SeqCst),
            SUBMITTERS * PER_THREAD,
            "每个任务必须恰好执行一次"
        );
    }

    /// ## 关闭后投递被丢弃
    ///
    /// - **意图 (Why)**：线程退出后绝不允许再有任务执行；关闭后的投递只能
    ///   被安全析构。
    #[test]
    fn push_after_close_is_discarded() {
        let queue = TaskQueue::new();
        queue.close();
        let executed = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&executed);
        assert!(!queue.push(Box::new(move || {
            probe.fetch_add(1, Ordering::SeqCst);
        })));
        assert!(queue.take_batch().is_empty(), "关闭后的队列不应积压任务");
        assert_eq!(executed.load(Ordering::SeqCst), 0, "被丢弃的任务不得执行");
    }

    /// ## 关闭幂等且能唤醒休眠线程
    #[test]
    fn close_is_idempotent_and_wakes_parker() {
        let queue = Arc::new(TaskQueue::new());
        let parker = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                queue.park(Duration::from_secs(5));
            })
        };
        // 给休眠线程一点进入等待的时间；即便竞争失败，park 也会因 closed 短路。
        thread::sleep(Duration::from_millis(20));
        queue.close();
        queue.close();
        parker.join().expect("休眠线程应被关闭信号唤醒");
        assert!(queue.is_closed());
    }
}

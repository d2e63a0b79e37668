//! verbs 传输上下文：本后端的组合根。

use std::os::fd::RawFd;
use std::sync::Arc;

use mesh_transport::{DomainDescriptor, TransportContext};

use crate::defer::Task;
use crate::epoll::{EpollLoop, EventHandler, Interest};
use crate::error::{self, IbvTransportError};
use crate::probe::{self, ProbeOutcome};
use crate::reactor::Reactor;
use crate::resolver;

/// 域描述符前缀：带上后端名，排障时一眼即可区分令牌来源。
const DOMAIN_DESCRIPTOR_PREFIX: &str = "ibv:";

fn generate_domain_descriptor() -> DomainDescriptor {
    // 若能从硬件栈拿到所属子网/通信域的标识就好了，但 verbs 并不提供这样
    // 的 API。于是约定为固定通配：两个进程都持有可用设备即认为互通——把
    // 两台带此类硬件的主机放进同一部署的用户，理应已完成相应的组网配置。
    DomainDescriptor::new(format!("{DOMAIN_DESCRIPTOR_PREFIX}*"))
}

/// 可用上下文拥有的两条事件循环。
struct LiveLoops {
    epoll: EpollLoop,
    reactor: Reactor,
}

/// verbs 后端的传输上下文。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 上下文是本后端对框架的唯一入口：构造时探测硬件可用性、生成对等协商
///   令牌，可用时拥有两条事件线程（描述符多路复用 + 完成反应器），并把
///   注册/延迟执行/解析能力委托给协作者使用。
/// - 硬件缺席是预期状态：工厂**从不失败**，缺席时返回惰性上下文，调用方
///   据 [`is_viable`](IbvContext::is_viable) 回退到其它后端。
///
/// ## 契约（What）
/// - **不变量**：`domain_descriptor().is_empty() ⟺ !is_viable()`；可用性
///   在构造时一次性确定，之后永不改变；
/// - **状态机**：不可用上下文自构造起即处于终态，所有生命周期与注册调用
///   都是安全空操作；可用上下文沿
///   `{Running} → close → {Closing} → join → {Joined}` 单向推进，不可复活；
/// - **并发**：`close` 非阻塞、幂等，可被任意线程并发重复调用；`join`
///   阻塞直到两条线程退出，重复调用立即返回；
/// - **自锁禁区**：绝不允许在反应器线程上的任务内调用 `join`（自我死锁），
///   此类调用方必须把 join 再延迟到其它线程执行。
///
/// ## 取舍（Trade-offs）
/// - 反应器约束状态的唯一同步原语就是延迟任务队列：简单、无锁协议、顺序
///   可推理，代价是所有跨线程操作都付一次队列往返。
pub struct IbvContext {
    descriptor: DomainDescriptor,
    live: Option<LiveLoops>,
}

impl IbvContext {
    /// 工厂：探测硬件并构造上下文；对硬件缺席从不失败。
    ///
    /// # 逻辑（How）
    /// 1. 执行三段式设备探测（见 [`crate::probe`]）；
    /// 2. 缺席 ⇒ 返回惰性上下文：空描述符、不启动任何线程；
    /// 3. 可用 ⇒ 启动 epoll 循环与反应器，并生成固定通配描述符。
    ///    此阶段的初始化失败意味着真实配置故障，按致命处理。
    pub fn create() -> Arc<IbvContext> {
        match probe::probe_devices() {
            ProbeOutcome::Unavailable => Arc::new(Self {
                descriptor: DomainDescriptor::unavailable(),
                live: None,
            }),
            ProbeOutcome::Viable { lib, devices } => {
                let epoll = EpollLoop::new()
                    .unwrap_or_else(|err| error::fatal(error::EPOLL_CREATE, err));
                let reactor = Reactor::new(lib, devices);
                Arc::new(Self {
                    descriptor: generate_domain_descriptor(),
                    live: Some(LiveLoops { epoll, reactor }),
                })
            }
        }
    }

    /// 当前主机上该后端是否可用。
    pub fn is_viable(&self) -> bool {
        self.live.is_some()
    }

    /// 对等协商使用的域描述符。
    pub fn domain_descriptor(&self) -> &DomainDescriptor {
        &self.descriptor
    }

    /// 注册描述符到 epoll 循环；不可用上下文上为空操作。
    pub fn register_descriptor(
        &self,
        fd: RawFd,
        interest: Interest,
        handler: Arc<dyn EventHandler>,
    ) {
        if let Some(live) = &self.live {
            live.epoll.register(fd, interest, handler);
        }
    }

    /// 从 epoll 循环注销描述符；幂等，不可用上下文上为空操作。
    pub fn unregister_descriptor(&self, fd: RawFd) {
        if let Some(live) = &self.live {
            live.epoll.unregister(fd);
        }
    }

    /// 把任务延迟到反应器线程执行；不可用上下文上任务被直接丢弃。
    ///
    /// 语义见 [`Reactor::defer`]：FIFO、至多一次、绝不内联。
    pub fn defer_to_loop(&self, task: impl FnOnce() + Send + 'static) {
        if let Some(live) = &self.live {
            live.reactor.defer(Box::new(task) as Task);
        }
    }

    /// 当前线程是否为反应器线程；不可用上下文恒为 `false`。
    pub fn in_loop(&self) -> bool {
        self.live.as_ref().is_some_and(|live| live.reactor.in_loop())
    }

    /// 暴露反应器给同后端的连接状态机（注册队列对处理器用）。
    pub fn reactor(&self) -> Option<&Reactor> {
        self.live.as_ref().map(|live| &live.reactor)
    }

    /// 按接口名解析可绑定地址。
    pub fn lookup_addr_for_iface(iface: &str) -> Result<String, IbvTransportError> {
        resolver::lookup_addr_for_iface(iface)
    }

    /// 按本机主机名解析可绑定地址。
    pub fn lookup_addr_for_hostname() -> Result<String, IbvTransportError> {
        resolver::lookup_addr_for_hostname()
    }

    /// 触发两条事件循环的有序停机；非阻塞、幂等、并发安全。
    pub fn close(&self) {
        if let Some(live) = &self.live {
            live.epoll.close();
            live.reactor.close();
        }
    }

    /// 阻塞等待两条事件线程退出；重复调用立即返回。
    ///
    /// 必须在 [`close`](IbvContext::close) 之后调用；对从未启动线程的
    /// 不可用上下文是安全空操作。
    pub fn join(&self) {
        if let Some(live) = &self.live {
            live.epoll.join();
            live.reactor.join();
        }
    }
}

impl TransportContext for IbvContext {
    fn is_viable(&self) -> bool {
        IbvContext::is_viable(self)
    }

    fn domain_descriptor(&self) -> &DomainDescriptor {
        IbvContext::domain_descriptor(self)
    }

    fn close(&self) {
        IbvContext::close(self);
    }

    fn join(&self) {
        IbvContext::join(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 描述符生成是可用性的纯函数：固定前缀 + 通配后缀。
    #[test]
    fn descriptor_is_fixed_wildcard_token() {
        assert_eq!(generate_domain_descriptor().as_str(), "ibv:*");
        assert_eq!(
            generate_domain_descriptor(),
            generate_domain_descriptor(),
            "重复生成必须得到相同令牌"
        );
    }

    /// 可用上下文之间的令牌总是互相兼容（明示接受的弱兼容性检查）。
    #[test]
    fn viable_tokens_always_match_each_other() {
        let lhs = generate_domain_descriptor();
        let rhs = generate_domain_descriptor();
        assert!(lhs.compatible(&rhs));
        assert!(!DomainDescriptor::unavailable().compatible(&lhs));
    }
}

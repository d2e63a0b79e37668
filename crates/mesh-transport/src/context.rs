use crate::descriptor::DomainDescriptor;

/// 统一的传输上下文契约。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 框架侧以同一套接口管理所有后端上下文：探测可用性、交换域描述符、
///   驱动有序停机。具体的建连/监听状态机由各后端自行提供，不在本契约内。
/// - 上下文的构造工厂由各后端以固有函数形式暴露（硬件探测参数各不相同），
///   契约只约束构造之后的公共行为。
///
/// ## 契约（What）
/// - **可用性**：`is_viable` 在构造时一次性确定，之后永不改变。调用方必须
///   先检查可用性，再将上下文用于任何 I/O；
/// - **域描述符**：`domain_descriptor` 与可用性严格对应——不可用上下文的
///   描述符为空令牌（参见 [`DomainDescriptor`] 的匹配规则）；
/// - **生命周期**：`close` 非阻塞、幂等、可被任意线程并发重复调用；`join`
///   阻塞直到上下文拥有的所有事件线程退出，必须在 `close` 之后调用（对
///   从未启动线程的不可用上下文则是安全的空操作）。已关闭/已汇合的上下文
///   不可复活。
///
/// ## 风险提示（Trade-offs）
/// - `join` 不提供超时；若在上下文自有事件线程内调用会自我死锁，调用方
///   必须改为异步延迟执行。
pub trait TransportContext: Send + Sync {
    /// 当前主机上该后端是否可用。
    fn is_viable(&self) -> bool;

    /// 返回对等协商使用的域描述符。
    fn domain_descriptor(&self) -> &DomainDescriptor;

    /// 触发有序停机；非阻塞且幂等。
    fn close(&self);

    /// 阻塞等待上下文拥有的事件线程全部退出。
    fn join(&self);
}

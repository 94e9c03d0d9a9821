//! 过滤器链与会话的集成测试。
//!
//! 以内存处理器代替传输层：写请求停留在会话写队列中，由测试显式取出并报告完成；
//! 关闭请求按传输层的约定清空写队列后派发 `session_closed`。


mod lifecycle;
mod ordering;

mod page;
mod runtime;
mod runtime_script;
mod timers;
mod tracking_script;

pub use page::{HeadlessPage, PageOutput};
pub use runtime::QuickJsEngine;
pub use runtime_script::runtime_script;
pub use timers::TimerQueue;
pub use tracking_script::tracking_script;

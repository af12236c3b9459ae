mod idle_reaper;

pub use idle_reaper::{IdleReaper, IdleSweep};

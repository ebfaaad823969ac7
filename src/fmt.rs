#![allow(unused_macros)]
#![allow(unused_imports)]

// defmt when enabled, otherwise the arguments are only borrowed
macro_rules! forward {
    ($level:ident, $s:literal $(, $x:expr)* $(,)?) => {
        {
            #[cfg(feature = "defmt")]
            ::defmt::$level!($s $(, $x)*);
            #[cfg(not(feature = "defmt"))]
            let _ = ($( & $x ),*);
        }
    };
}

macro_rules! trace {
    ($($t:tt)*) => { $crate::fmt::forward!(trace, $($t)*) };
}

macro_rules! debug {
    ($($t:tt)*) => { $crate::fmt::forward!(debug, $($t)*) };
}

macro_rules! info {
    ($($t:tt)*) => { $crate::fmt::forward!(info, $($t)*) };
}

macro_rules! warning {
    ($($t:tt)*) => { $crate::fmt::forward!(warn, $($t)*) };
}

macro_rules! error {
    ($($t:tt)*) => { $crate::fmt::forward!(error, $($t)*) };
}

pub(crate) use debug;
pub(crate) use error;
pub(crate) use forward;
pub(crate) use info;
pub(crate) use trace;
pub(crate) use warning;

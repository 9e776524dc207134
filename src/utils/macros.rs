/// Print to the kernel console.
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => ({
        $crate::utils::console::_print(format_args!($($arg)*));
    });
}

/// Print with new line to the kernel console.
#[macro_export]
macro_rules! kprintln {
    () => ($crate::kprint!("\n"));
    ($fmt:expr) => ($crate::kprint!("{}\n", format_args!($fmt)));
    ($fmt:expr, $($arg:tt)*) => ($crate::kprint!("{}\n", format_args!($fmt, $($arg)*)));
}

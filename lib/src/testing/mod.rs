//! In-tree test harness.
//!
//! Test functions return a [`TestResult`] and use the assertion macros from
//! [`assertions`](self) so a failure logs through klog and returns early
//! instead of unwinding.  [`define_test_suite!`](crate::define_test_suite)
//! registers a list of such functions with the host test runner.

mod assertions;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestResult {
    Pass,
    Fail,
    Panic,
    Skipped,
}

impl TestResult {
    #[inline]
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass | Self::Skipped)
    }

    #[inline]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Fail | Self::Panic)
    }
}

#[macro_export]
macro_rules! pass {
    () => {
        $crate::testing::TestResult::Pass
    };
}

#[macro_export]
macro_rules! fail {
    () => {
        $crate::testing::TestResult::Fail
    };
    ($msg:expr) => {{
        $crate::klog_info!("TEST FAIL: {}", $msg);
        $crate::testing::TestResult::Fail
    }};
    ($fmt:expr, $($arg:tt)*) => {{
        $crate::klog_info!(concat!("TEST FAIL: ", $fmt), $($arg)*);
        $crate::testing::TestResult::Fail
    }};
}

/// Register a suite of `fn() -> TestResult` functions.
///
/// Expands to a `#[cfg(test)]` module named `<suite>_suite` holding one
/// `#[test]` per function, each asserting the function passed.
#[macro_export]
macro_rules! define_test_suite {
    ($suite_name:ident, [$($test_fn:ident),* $(,)?]) => {
        $crate::paste::paste! {
            #[cfg(test)]
            mod [<$suite_name _suite>] {
                $(
                    #[test]
                    fn $test_fn() {
                        let result = super::$test_fn();
                        assert!(
                            result.is_pass(),
                            "{}::{} returned {:?}",
                            stringify!($suite_name),
                            stringify!($test_fn),
                            result
                        );
                    }
                )*
            }
        }
    };
}

pub(crate) use assert2::{assert, let_assert as assert_let};

macro_rules! S {
    ($s:expr) => {
        String::from($s)
    };
}
pub(crate) use S;

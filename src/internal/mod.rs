pub(crate) mod exit_status_error;
pub(crate) mod macros;
pub(crate) mod std_ext;

#[cfg(test)]
pub(crate) mod test_utils;

pub(crate) mod delegation;
pub(crate) mod hook;
pub(crate) mod mode;
pub(crate) mod status;
pub(crate) mod task;

pub mod line_ending_handler;
pub mod mem_logger;
pub mod path_utils;

use meshprobe::ProbeError;

pub const SUCCESS: i32 = 0;
pub const EXECUTION_ERROR: i32 = 1;
pub const INPUT_ERROR: i32 = 2;
pub const CONNECTION_ERROR: i32 = 3;
pub const INTERRUPTED: i32 = 130;

pub fn for_error(error: &ProbeError) -> i32 {
    match error {
        ProbeError::Cancelled => INTERRUPTED,
        ProbeError::InvalidConfig(_)
        | ProbeError::UnknownSource(_)
        | ProbeError::Json(_)
        | ProbeError::Yaml(_) => INPUT_ERROR,
        e if e.is_source_level() => CONNECTION_ERROR,
        _ => EXECUTION_ERROR,
    }
}

/// The publishing mode requested by a publish command
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum PublishMode {
    /// Data is not recorded
    Live,

    /// Data should be recorded to a new file
    Record,

    /// Data should be appended to the existing recording
    Append,
}

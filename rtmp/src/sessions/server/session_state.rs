#[derive(Eq, PartialEq, Debug)]
pub enum SessionState {
    Started,
    Connected,
}

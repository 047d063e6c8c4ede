use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("could not load configuration")]
    Config,
    #[display("could not open content store at {_0}")]
    Open(#[error(not(source))] String),
    #[display("content store operation failed")]
    Store,
    #[display("could not write output")]
    Output,
}

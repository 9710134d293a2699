use std::io;

use thiserror::Error;

use crate::thread::Tid;

#[derive(Error, Debug)]
pub enum Error {
    #[error("stack allocation failed: {0}")]
    StackAlloc(#[source] io::Error),
    #[error("stack release failed: {0}")]
    StackRelease(#[source] io::Error),
    #[error("already running as thread {0}")]
    AlreadyStarted(Tid),
    #[error("a runtime is already entered on this OS thread")]
    AlreadyEntered,
}

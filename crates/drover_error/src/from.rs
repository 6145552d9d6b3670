use crate::DroverError;
use std::num::ParseIntError;

impl From<nix::errno::Errno> for DroverError {
    fn from(err: nix::errno::Errno) -> Self {
        DroverError::Os(err.to_string())
    }
}

impl From<std::io::Error> for DroverError {
    fn from(err: std::io::Error) -> Self {
        DroverError::Io(err.to_string())
    }
}

impl From<ParseIntError> for DroverError {
    fn from(err: ParseIntError) -> Self {
        DroverError::InvalidConfig(err.to_string())
    }
}

impl From<anyhow::Error> for DroverError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<DroverError>() {
            Ok(err) => err,
            Err(err) => DroverError::Work(format!("{:#}", err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anyhow_keeps_wrapped_drover_error() {
        let err: DroverError = anyhow::Error::new(DroverError::Exit(4)).into();
        assert_eq!(err, DroverError::Exit(4));
    }

    #[test]
    fn test_anyhow_context_becomes_work_error() {
        let err: DroverError = anyhow::anyhow!("socket gone").context("serving").into();
        assert_eq!(err, DroverError::Work("serving: socket gone".to_string()));
    }

    #[test]
    fn test_errno_becomes_os_error() {
        let err: DroverError = nix::errno::Errno::ESRCH.into();
        assert!(matches!(err, DroverError::Os(_)));
    }
}

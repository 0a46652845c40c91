//! WASI `errno` values.

use core::fmt;

/// Result of a descriptor-level operation.
///
/// The error side is always a WASI errno other than [`Errno::SUCCESS`].
pub type FdResult<T> = Result<T, Errno>;

/// A WASI errno code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Errno(u16);

impl Errno {
    pub const SUCCESS: Errno = Errno(0);
    pub const ACCES: Errno = Errno(2);
    pub const AGAIN: Errno = Errno(6);
    pub const BADF: Errno = Errno(8);
    pub const EXIST: Errno = Errno(20);
    pub const FAULT: Errno = Errno(21);
    pub const INVAL: Errno = Errno(28);
    pub const IO: Errno = Errno(29);
    pub const ISDIR: Errno = Errno(31);
    pub const NAMETOOLONG: Errno = Errno(37);
    pub const NFILE: Errno = Errno(41);
    pub const NOENT: Errno = Errno(44);
    pub const NOSYS: Errno = Errno(52);
    pub const NOTDIR: Errno = Errno(54);
    pub const NOTEMPTY: Errno = Errno(55);
    pub const NOTSUP: Errno = Errno(58);
    pub const OVERFLOW: Errno = Errno(61);
    pub const PERM: Errno = Errno(63);
    pub const SPIPE: Errno = Errno(70);
    pub const XDEV: Errno = Errno(75);

    pub const fn from_raw(raw: u16) -> Self {
        Errno(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// `Ok(())` for SUCCESS, `Err(self)` otherwise.
    pub fn into_result(self) -> FdResult<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// Collapse a descriptor result back into the code a guest sees.
    pub fn of<T>(result: &FdResult<T>) -> Errno {
        match result {
            Ok(_) => Errno::SUCCESS,
            Err(e) => *e,
        }
    }

    fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            0 => "SUCCESS",
            2 => "ACCES",
            6 => "AGAIN",
            8 => "BADF",
            20 => "EXIST",
            21 => "FAULT",
            28 => "INVAL",
            29 => "IO",
            31 => "ISDIR",
            37 => "NAMETOOLONG",
            41 => "NFILE",
            44 => "NOENT",
            52 => "NOSYS",
            54 => "NOTDIR",
            55 => "NOTEMPTY",
            58 => "NOTSUP",
            61 => "OVERFLOW",
            63 => "PERM",
            70 => "SPIPE",
            75 => "XDEV",
            _ => return None,
        })
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "errno {}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_result_maps_success_only() {
        assert_eq!(Errno::SUCCESS.into_result(), Ok(()));
        assert_eq!(Errno::BADF.into_result(), Err(Errno::BADF));
    }

    #[test]
    fn display_names_known_codes() {
        assert_eq!(alloc::format!("{}", Errno::NOENT), "NOENT (44)");
        assert_eq!(alloc::format!("{}", Errno::from_raw(99)), "errno 99");
    }
}

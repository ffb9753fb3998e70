//! Process startup frame
//!
//! The guest entry point receives a pointer to a FreeBSD-style initial stack
//! image: `argc`, the argument vector, an empty environment and an auxiliary
//! vector naming the boot module's entry point.

use ob_core::error::KernelError;
use std::ffi::CString;

/// Words in the frame.
pub const FRAME_WORDS: usize = 128;

/// Auxiliary vector type carrying the program entry point.
pub const AT_ENTRY: u64 = 9;

/// Frame words besides the argument pointers: argc, progname, two vector
/// terminators and two auxiliary pairs.
const FIXED_WORDS: usize = 8;

pub struct StartupFrame {
    words: Box<[u64; FRAME_WORDS]>,
    // Referenced by pointer from `words`.
    _strings: Vec<CString>,
}

impl StartupFrame {
    pub fn new(progname: &str, args: &[String], entry: u64) -> Result<Self, KernelError> {
        if args.len() + FIXED_WORDS > FRAME_WORDS {
            return Err(KernelError::StartupFrame(format!("too many arguments ({})", args.len())));
        }

        let strings = std::iter::once(progname)
            .chain(args.iter().map(String::as_str))
            .map(|s| CString::new(s).map_err(|_| KernelError::StartupFrame(format!("argument {:?} contains NUL", s))))
            .collect::<Result<Vec<_>, _>>()?;

        let mut words = Box::new([0u64; FRAME_WORDS]);
        words[0] = strings.len() as u64;
        let mut next = 1;
        for string in &strings {
            words[next] = string.as_ptr() as u64;
            next += 1;
        }
        // argv and envp terminators.
        next += 2;
        words[next] = AT_ENTRY;
        words[next + 1] = entry;
        // AT_NULL pair follows as zeros.

        Ok(Self {
            words,
            _strings: strings,
        })
    }

    pub fn argc(&self) -> u64 {
        self.words[0]
    }

    pub fn words(&self) -> &[u64] {
        &self.words[..]
    }

    pub fn as_ptr(&self) -> *const u64 {
        self.words.as_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    #[test]
    fn test_frame_layout() {
        let args = vec!["-v".to_string(), "save0".to_string()];
        let frame = StartupFrame::new("eboot.bin", &args, 0x4000_1000).unwrap();
        let words = frame.words();

        assert_eq!(frame.argc(), 3);
        let argv0 = unsafe { CStr::from_ptr(words[1] as *const std::ffi::c_char) };
        assert_eq!(argv0.to_str().unwrap(), "eboot.bin");
        let argv2 = unsafe { CStr::from_ptr(words[3] as *const std::ffi::c_char) };
        assert_eq!(argv2.to_str().unwrap(), "save0");

        assert_eq!(&words[4..10], &[0, 0, AT_ENTRY, 0x4000_1000, 0, 0]);
    }

    #[test]
    fn test_too_many_arguments() {
        let args = vec!["x".to_string(); FRAME_WORDS];
        assert!(matches!(
            StartupFrame::new("eboot.bin", &args, 0),
            Err(KernelError::StartupFrame(_))
        ));

        let args = vec!["x".to_string(); FRAME_WORDS - FIXED_WORDS];
        assert!(StartupFrame::new("eboot.bin", &args, 0).is_ok());
    }

    #[test]
    fn test_nul_in_argument() {
        let args = vec!["a\0b".to_string()];
        assert!(StartupFrame::new("eboot.bin", &args, 0).is_err());
    }
}

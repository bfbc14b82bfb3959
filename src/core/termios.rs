//! Terminal attributes
//!
//! `Termios` mirrors the POSIX structure: four flag words, a control character
//! table and line speeds. Flag words are `bitflags` sets; the numeric values are
//! the ones applications compiled against the POSIX layer expect.

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct InputFlags: u32 {
        const IGNBRK  = 0x00001;
        const BRKINT  = 0x00002;
        const IGNPAR  = 0x00004;
        const IMAXBEL = 0x00008;
        const INPCK   = 0x00010;
        const ISTRIP  = 0x00020;
        const INLCR   = 0x00040;
        const IGNCR   = 0x00080;
        const ICRNL   = 0x00100;
        const IXON    = 0x00400;
        const IXOFF   = 0x01000;
        const IUCLC   = 0x04000;
        const IXANY   = 0x08000;
        const PARMRK  = 0x10000;
        const IUTF8   = 0x20000;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct OutputFlags: u32 {
        const OPOST  = 0x00001;
        const OLCUC  = 0x00002;
        const OCRNL  = 0x00004;
        const ONLCR  = 0x00008;
        const ONOCR  = 0x00010;
        const ONLRET = 0x00020;
        const OFILL  = 0x00040;
        const OFDEL  = 0x08000;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ControlFlags: u32 {
        const CBAUD  = 0x0100f;
        const CSIZE  = 0x00030;
        const CS5    = 0x00000;
        const CS6    = 0x00010;
        const CS7    = 0x00020;
        const CS8    = 0x00030;
        const CSTOPB = 0x00040;
        const CREAD  = 0x00080;
        const PARENB = 0x00100;
        const PARODD = 0x00200;
        const HUPCL  = 0x00400;
        const CLOCAL = 0x00800;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct LocalFlags: u32 {
        const ISIG    = 0x0001;
        const ICANON  = 0x0002;
        const ECHO    = 0x0004;
        const ECHOE   = 0x0008;
        const ECHOK   = 0x0010;
        const ECHONL  = 0x0020;
        const NOFLSH  = 0x0040;
        const TOSTOP  = 0x0080;
        const IEXTEN  = 0x0100;
        const FLUSHO  = 0x0200;
        const ECHOKE  = 0x0400;
        const ECHOCTL = 0x0800;
        const PENDIN  = 0x1000;
    }
}

// c_cc indices
pub const VDISCARD: usize = 1;
pub const VEOL: usize = 2;
pub const VEOL2: usize = 3;
pub const VEOF: usize = 4;
pub const VERASE: usize = 5;
pub const VINTR: usize = 6;
pub const VKILL: usize = 7;
pub const VLNEXT: usize = 8;
pub const VMIN: usize = 9;
pub const VQUIT: usize = 10;
pub const VREPRINT: usize = 11;
pub const VSTART: usize = 12;
pub const VSTOP: usize = 13;
pub const VSUSP: usize = 14;
pub const VSWTC: usize = 15;
pub const VTIME: usize = 16;
pub const VWERASE: usize = 17;
pub const NCCS: usize = 18;

/// `_POSIX_VDISABLE`: a control character slot holding this never matches.
pub const VDISABLE: u8 = 0;

pub const B38400: u32 = 0x0000f;

/// Control key equivalent of an ASCII letter.
pub const fn ctrl(c: u8) -> u8 {
    c & 0x1f
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Termios {
    pub iflag: InputFlags,
    pub oflag: OutputFlags,
    pub cflag: ControlFlags,
    pub lflag: LocalFlags,
    pub cc: [u8; NCCS],
    pub ispeed: u32,
    pub ospeed: u32,
}

impl Default for Termios {
    fn default() -> Self {
        Self::tcinit()
    }
}

impl Termios {
    /// Attributes a freshly allocated terminal starts with.
    pub fn tcinit() -> Self {
        let mut cc = [VDISABLE; NCCS];
        cc[VINTR] = ctrl(b'C');
        cc[VQUIT] = 0x1c;
        cc[VERASE] = 0x08;
        cc[VKILL] = ctrl(b'U');
        cc[VEOF] = ctrl(b'D');
        cc[VTIME] = 0;
        cc[VMIN] = 1;
        cc[VSTART] = ctrl(b'Q');
        cc[VSTOP] = ctrl(b'S');
        cc[VSUSP] = ctrl(b'Z');
        cc[VREPRINT] = ctrl(b'R');
        cc[VDISCARD] = ctrl(b'O');
        cc[VWERASE] = ctrl(b'W');
        cc[VLNEXT] = ctrl(b'V');
        Self {
            iflag: InputFlags::BRKINT | InputFlags::ICRNL | InputFlags::IXON | InputFlags::IUTF8,
            oflag: OutputFlags::OPOST | OutputFlags::ONLCR,
            cflag: ControlFlags::from_bits_retain(B38400) | ControlFlags::CS8 | ControlFlags::CREAD,
            lflag: LocalFlags::ISIG
                | LocalFlags::ICANON
                | LocalFlags::ECHO
                | LocalFlags::ECHOE
                | LocalFlags::ECHOK
                | LocalFlags::ECHOCTL
                | LocalFlags::ECHOKE
                | LocalFlags::IEXTEN,
            cc,
            ispeed: B38400,
            ospeed: B38400,
        }
    }

    /// True when `c` equals the enabled control character at `index`.
    pub fn is_cc(&self, index: usize, c: u8) -> bool {
        let v = self.cc[index];
        v != VDISABLE && v == c
    }

    pub fn canonical(&self) -> bool {
        self.lflag.contains(LocalFlags::ICANON)
    }

    /// Raw mode as `cfmakeraw` defines it.
    pub fn make_raw(&mut self) {
        self.iflag.remove(
            InputFlags::IGNBRK
                | InputFlags::BRKINT
                | InputFlags::PARMRK
                | InputFlags::ISTRIP
                | InputFlags::INLCR
                | InputFlags::IGNCR
                | InputFlags::ICRNL
                | InputFlags::IXON,
        );
        self.oflag.remove(OutputFlags::OPOST);
        self.lflag.remove(
            LocalFlags::ECHO | LocalFlags::ECHONL | LocalFlags::ICANON | LocalFlags::ISIG | LocalFlags::IEXTEN,
        );
        self.cflag.remove(ControlFlags::CSIZE | ControlFlags::PARENB);
        self.cflag.insert(ControlFlags::CS8);
        self.cc[VMIN] = 1;
        self.cc[VTIME] = 0;
    }
}

/// Window size as carried by `TIOCGWINSZ`/`TIOCSWINSZ`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Winsize {
    pub rows: u16,
    pub cols: u16,
    pub xpixel: u16,
    pub ypixel: u16,
}

impl Winsize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { rows, cols, xpixel: 0, ypixel: 0 }
    }
}

/// When `tcsetattr` takes effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetAction {
    Now,
    Drain,
    Flush,
}

/// Which queue `tcflush` discards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushQueue {
    Input,
    Output,
    Both,
}

impl FlushQueue {
    pub fn input(self) -> bool {
        matches!(self, FlushQueue::Input | FlushQueue::Both)
    }

    pub fn output(self) -> bool {
        matches!(self, FlushQueue::Output | FlushQueue::Both)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let t = Termios::tcinit();
        assert!(t.canonical());
        assert!(t.lflag.contains(LocalFlags::ECHO | LocalFlags::ISIG));
        assert!(t.iflag.contains(InputFlags::ICRNL | InputFlags::IXON));
        assert!(t.oflag.contains(OutputFlags::OPOST | OutputFlags::ONLCR));
        assert_eq!(t.cc[VINTR], 3);
        assert_eq!(t.cc[VEOF], 4);
        assert_eq!(t.cc[VMIN], 1);
    }

    #[test]
    fn test_disabled_cc_never_matches() {
        let t = Termios::tcinit();
        assert_eq!(t.cc[VEOL], VDISABLE);
        assert!(!t.is_cc(VEOL, 0));
        assert!(t.is_cc(VINTR, 3));
    }

    #[test]
    fn test_make_raw() {
        let mut t = Termios::tcinit();
        t.make_raw();
        assert!(!t.canonical());
        assert!(!t.lflag.contains(LocalFlags::ECHO));
        assert!(!t.oflag.contains(OutputFlags::OPOST));
        assert!(!t.iflag.contains(InputFlags::ICRNL));
    }
}

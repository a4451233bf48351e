use std::{
    collections::VecDeque,
    fmt,
    io::Write,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use crossterm::{
    cursor::MoveToColumn,
    QueueableCommand,
    Result,
    style::Print,
    terminal::{Clear, ClearType},
    tty::IsTty,
};
use number_prefix::NumberPrefix;

use fuslib::transfer::{TransferObserver, Warning};

/// Window over which the transfer speed is averaged
const SPEED_WINDOW: Duration = Duration::from_secs(10);

/// Byte count rendered with binary prefixes (eg. `1.5 MiB`).
pub struct BinarySize(pub u64);

impl fmt::Display for BinarySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match NumberPrefix::binary(self.0 as f64) {
            NumberPrefix::Standalone(n) => write!(f, "{n:.0} B"),
            NumberPrefix::Prefixed(p, n) => write!(f, "{n:.1} {p}B"),
        }
    }
}

/// Moving average of the transfer speed.
#[derive(Debug)]
struct Speed {
    buf: VecDeque<(Instant, u64)>,
}

impl Speed {
    fn new() -> Self {
        Self {
            buf: VecDeque::new(),
        }
    }

    fn record(&mut self, value: u64) {
        let now = Instant::now();
        self.buf.push_back((now, value));

        while self.buf.len() > 2 && self.buf.front().map_or(false, |x| now - x.0 > SPEED_WINDOW) {
            self.buf.pop_front();
        }
    }

    fn bytes_per_sec(&self) -> u64 {
        match (self.buf.front(), self.buf.back()) {
            (Some(f), Some(b)) if b.0 > f.0 => {
                ((b.1 - f.1) as f64 / (b.0 - f.0).as_secs_f64()) as u64
            }
            _ => 0,
        }
    }
}

/// How progress lines are drawn
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DrawMode {
    /// Redraw the same line. Used for interactive terminals.
    Interactive,
    /// Print a new line for every frame. Used when the output is redirected or
    /// when log messages would clobber the progress line.
    Append,
}

impl DrawMode {
    fn frame_interval(self) -> Duration {
        match self {
            Self::Interactive => Duration::from_millis(100),
            Self::Append => Duration::from_secs(5),
        }
    }
}

/// Progress indicator for transfers, drawn on a terminal.
pub struct ProgressReporter<T: Write + IsTty> {
    term: T,
    mode: DrawMode,
    pos: u64,
    len: u64,
    last_draw: Option<Instant>,
    speed: Speed,
    cancelled: Arc<AtomicBool>,
}

impl<T: Write + IsTty> ProgressReporter<T> {
    pub fn new(term: T, cancelled: Arc<AtomicBool>) -> Self {
        let mode = if term.is_tty() {
            DrawMode::Interactive
        } else {
            DrawMode::Append
        };

        Self {
            term,
            mode,
            pos: 0,
            len: 0,
            last_draw: None,
            speed: Speed::new(),
            cancelled,
        }
    }

    pub fn set_mode(&mut self, mode: DrawMode) {
        self.mode = mode;
    }

    fn clear_line(&mut self) -> Result<()> {
        if self.mode == DrawMode::Interactive {
            self.term
                .queue(Clear(ClearType::CurrentLine))?
                .queue(MoveToColumn(0))?;
        }
        Ok(())
    }

    /// Print a message without clobbering the progress line.
    pub fn println(&mut self, msg: &str) -> Result<()> {
        self.clear_line()?;
        self.term
            .queue(Print(msg))?
            .queue(Print('\n'))?;
        self.draw(true)
    }

    /// Draw the final state and move past the progress line.
    pub fn finish(&mut self) -> Result<()> {
        if self.last_draw.is_some() {
            self.draw(true)?;
            if self.mode == DrawMode::Interactive {
                self.term.queue(Print('\n'))?;
            }
            self.term.flush()?;
            self.last_draw = None;
        }
        Ok(())
    }

    fn draw(&mut self, force: bool) -> Result<()> {
        if !force {
            if let Some(t) = self.last_draw {
                if t.elapsed() < self.mode.frame_interval() {
                    return Ok(());
                }
            }
        }

        let percent = if self.len == 0 {
            100.0
        } else {
            (self.pos as f64 / self.len as f64 * 100.0).clamp(0.0, 100.0)
        };

        self.clear_line()?;
        self.term.queue(Print(format!(
            "{percent:.0}% {}/{} ({}/s)",
            BinarySize(self.pos),
            BinarySize(self.len),
            BinarySize(self.speed.bytes_per_sec()),
        )))?;
        if self.mode == DrawMode::Append {
            self.term.queue(Print('\n'))?;
        }
        self.term.flush()?;

        self.last_draw = Some(Instant::now());

        Ok(())
    }
}

impl<T: Write + IsTty> TransferObserver for ProgressReporter<T> {
    fn on_start(&mut self, offset: u64, total: u64) {
        self.pos = offset;
        self.len = total;
        self.speed.record(offset);
        let _ = self.draw(true);
    }

    fn on_progress(&mut self, bytes: u64) {
        self.pos = self.pos.saturating_add(bytes);
        self.speed.record(self.pos);
        let _ = self.draw(false);
    }

    fn on_warning(&mut self, warning: &Warning) {
        let _ = self.println(&format!("Warning: {warning}"));
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

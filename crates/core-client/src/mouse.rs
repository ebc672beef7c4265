//! Mouse-state helper: fold analog IO samples into either deltas or
//! clamped absolute positions, whichever the caller asked for.

use core_events::{Category, EventRecord, IoDataType, IoDeviceKind};

#[derive(Debug, Default)]
pub struct MouseState {
    relative: bool,
    ax: i32,
    ay: i32,
    lx: i32,
    ly: i32,
}

impl MouseState {
    pub fn new(relative: bool) -> Self {
        Self {
            relative,
            ..Default::default()
        }
    }

    /// Feed one inbound event. Returns the (x, y) to act on when the
    /// sample was a mouse motion that actually moved, in the requested
    /// coordinate space.
    pub fn sample(
        &mut self,
        width: u32,
        height: u32,
        ev: &EventRecord,
    ) -> Option<(i32, i32)> {
        if ev.category() != Some(Category::Io) {
            return None;
        }
        let io = ev.io_payload();
        if IoDeviceKind::from_raw(io.devkind) != Some(IoDeviceKind::Mouse)
            || IoDataType::from_raw(io.datatype) != Some(IoDataType::Analog)
        {
            return None;
        }

        let analog = unsafe { io.input.analog };
        let gotrel = analog.gotrel != 0;

        // samples arrive either packed (x, y in one record on subid 0)
        // or split per axis on subid 0/1
        let (dx, dy) = if analog.nvalues >= 2 && io.subid == 0 {
            (analog.axisval[0] as i32, analog.axisval[1] as i32)
        } else if io.subid == 0 {
            (analog.axisval[0] as i32, 0)
        } else {
            (0, analog.axisval[0] as i32)
        };

        match (self.relative, gotrel) {
            // want deltas, got deltas
            (true, true) => {
                if dx == 0 && dy == 0 {
                    return None;
                }
                Some((dx, dy))
            }
            // want deltas, got absolute: derive from history
            (true, false) => {
                let (ox, oy) = (self.lx, self.ly);
                self.lx = dx;
                self.ly = dy;
                let (rx, ry) = (dx - ox, dy - oy);
                if rx == 0 && ry == 0 {
                    return None;
                }
                Some((rx, ry))
            }
            // want absolute, got deltas: accumulate and clamp
            (false, true) => {
                self.ax += dx;
                self.ay += dy;
                self.clamped(width, height)
            }
            // want absolute, got absolute
            (false, false) => {
                self.ax = dx;
                self.ay = dy;
                self.clamped(width, height)
            }
        }
    }

    fn clamped(&mut self, width: u32, height: u32) -> Option<(i32, i32)> {
        self.ax = self.ax.clamp(0, width as i32);
        self.ay = self.ay.clamp(0, height as i32);

        // clamping can make a relative sample a no-op; drop those before
        // they reach the caller
        if self.lx == self.ax && self.ly == self.ay {
            return None;
        }
        self.lx = self.ax;
        self.ly = self.ay;
        Some((self.ax, self.ay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_events::AnalogInput;

    fn motion(subid: u16, rel: bool, x: i16, y: i16) -> EventRecord {
        let mut ev = EventRecord::io(IoDeviceKind::Mouse, IoDataType::Analog);
        ev.io_payload_mut().subid = subid;
        ev.io_payload_mut().input.analog = AnalogInput {
            gotrel: rel as u8,
            nvalues: 2,
            axisval: [x, y, 0, 0],
        };
        ev
    }

    #[test]
    fn absolute_accumulates_relative_samples() {
        let mut ms = MouseState::new(false);
        assert_eq!(ms.sample(100, 100, &motion(0, true, 10, 5)), Some((10, 5)));
        assert_eq!(ms.sample(100, 100, &motion(0, true, 10, 5)), Some((20, 10)));
        // clamped at the surface edge
        assert_eq!(
            ms.sample(100, 100, &motion(0, true, 1000, 0)),
            Some((100, 10))
        );
        // pushing further past the edge changes nothing: suppressed
        assert_eq!(ms.sample(100, 100, &motion(0, true, 50, 0)), None);
    }

    #[test]
    fn relative_from_absolute_derives_deltas() {
        let mut ms = MouseState::new(true);
        assert_eq!(ms.sample(100, 100, &motion(0, false, 40, 40)), Some((40, 40)));
        assert_eq!(ms.sample(100, 100, &motion(0, false, 45, 38)), Some((5, -2)));
        assert_eq!(ms.sample(100, 100, &motion(0, false, 45, 38)), None);
    }

    #[test]
    fn non_mouse_events_are_ignored() {
        let mut ms = MouseState::new(true);
        let ev = EventRecord::io(IoDeviceKind::Keyboard, IoDataType::Translated);
        assert_eq!(ms.sample(100, 100, &ev), None);
    }
}

//! [`GpioDriver`] over the GPIO character device, uAPI v2.

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use gpiocdev::line as cdev;

use crate::backend::{ChipPort, GpioDriver, LineRequestPort};
use crate::edge::{EdgeEvent, EdgeKind};
use crate::gpio::{Bias, ChipInfo, Direction, EdgeDetection, Level, LineInfo, LineSettings};

/// Talks to `/dev/gpiochipN` through the `gpiocdev` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct CdevDriver;

impl GpioDriver for CdevDriver {
    fn open_chip(&self, path: &Path) -> io::Result<Box<dyn ChipPort>> {
        let chip = gpiocdev::chip::Chip::from_path(path).map_err(into_io)?;
        Ok(Box::new(CdevChip {
            path: path.to_path_buf(),
            chip,
        }))
    }
}

struct CdevChip {
    path: PathBuf,
    chip: gpiocdev::chip::Chip,
}

impl ChipPort for CdevChip {
    fn info(&self) -> io::Result<ChipInfo> {
        let info = self.chip.info().map_err(into_io)?;
        Ok(ChipInfo {
            path: self.path.clone(),
            name: info.name.to_string(),
            label: info.label.to_string(),
            num_lines: info.num_lines,
        })
    }

    fn line_info(&self, offset: u32) -> io::Result<LineInfo> {
        let info = self.chip.line_info(offset).map_err(into_io)?;
        Ok(LineInfo {
            offset: info.offset,
            name: info.name.to_string(),
            consumer: info.consumer.to_string(),
            used: info.used,
            direction: match info.direction {
                cdev::Direction::Output => Direction::Output,
                _ => Direction::Input,
            },
            active_low: info.active_low,
            bias: match info.bias {
                Some(cdev::Bias::PullUp) => Bias::PullUp,
                Some(cdev::Bias::PullDown) => Bias::PullDown,
                Some(cdev::Bias::Disabled) => Bias::Disabled,
                None => Bias::AsIs,
            },
            edge: match info.edge_detection {
                Some(cdev::EdgeDetection::RisingEdge) => EdgeDetection::Rising,
                Some(cdev::EdgeDetection::FallingEdge) => EdgeDetection::Falling,
                Some(cdev::EdgeDetection::BothEdges) => EdgeDetection::Both,
                None => EdgeDetection::None,
            },
            debounce: info.debounce_period,
        })
    }

    fn request_line(
        &self,
        offset: u32,
        settings: &LineSettings,
        consumer: &str,
    ) -> io::Result<Box<dyn LineRequestPort>> {
        let mut builder = gpiocdev::Request::builder();
        builder
            .on_chip(self.path.clone())
            .with_consumer(consumer)
            .with_line(offset);

        match settings.direction {
            Direction::Input => {
                builder.as_input();
                match settings.bias {
                    Bias::AsIs => {}
                    Bias::Disabled => {
                        builder.with_bias(cdev::Bias::Disabled);
                    }
                    Bias::PullUp => {
                        builder.with_bias(cdev::Bias::PullUp);
                    }
                    Bias::PullDown => {
                        builder.with_bias(cdev::Bias::PullDown);
                    }
                }
                match settings.edge {
                    EdgeDetection::None => {}
                    EdgeDetection::Rising => {
                        builder.with_edge_detection(cdev::EdgeDetection::RisingEdge);
                    }
                    EdgeDetection::Falling => {
                        builder.with_edge_detection(cdev::EdgeDetection::FallingEdge);
                    }
                    EdgeDetection::Both => {
                        builder.with_edge_detection(cdev::EdgeDetection::BothEdges);
                    }
                }
                if let Some(period) = settings.debounce {
                    builder.with_debounce_period(period);
                }
            }
            Direction::Output => {
                builder.as_output(to_value(settings.initial));
            }
        }

        if settings.active_low {
            builder.as_active_low();
        }

        let request = builder.request().map_err(into_io)?;
        Ok(Box::new(CdevLineRequest { request }))
    }
}

struct CdevLineRequest {
    request: gpiocdev::Request,
}

impl LineRequestPort for CdevLineRequest {
    fn value(&self, offset: u32) -> io::Result<Level> {
        match self.request.value(offset).map_err(into_io)? {
            cdev::Value::Active => Ok(Level::High),
            cdev::Value::Inactive => Ok(Level::Low),
        }
    }

    fn set_value(&self, offset: u32, level: Level) -> io::Result<()> {
        self.request
            .set_value(offset, to_value(level))
            .map(|_| ())
            .map_err(into_io)
    }

    fn wait_edge_events(&self, timeout: Duration) -> io::Result<bool> {
        self.request.wait_edge_event(timeout).map_err(into_io)
    }

    fn read_edge_events(&self, buf: &mut Vec<EdgeEvent>, max: usize) -> io::Result<usize> {
        let mut count = 0;
        while count < max && self.request.has_edge_event().map_err(into_io)? {
            let event = self.request.read_edge_event().map_err(into_io)?;
            buf.push(EdgeEvent {
                kind: match event.kind {
                    cdev::EdgeKind::Rising => EdgeKind::Rising,
                    cdev::EdgeKind::Falling => EdgeKind::Falling,
                },
                timestamp_ns: event.timestamp_ns,
                offset: event.offset,
                seqno: event.seqno,
                line_seqno: event.line_seqno,
            });
            count += 1;
        }
        Ok(count)
    }
}

fn to_value(level: Level) -> cdev::Value {
    match level {
        Level::High => cdev::Value::Active,
        Level::Low => cdev::Value::Inactive,
    }
}

fn into_io(err: gpiocdev::Error) -> io::Error {
    io::Error::other(err)
}

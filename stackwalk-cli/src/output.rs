//! Human-readable and JSON reports of walked threads.

use std::io::{self, Write};

use serde_json::json;
use stackwalk::{Architecture, CallStack, StackWalker, WalkError, WalkState};

/// One walked frame, with everything the reports print already resolved.
#[derive(Debug, Clone)]
pub struct FrameReport {
    pub state: WalkState,
    pub instruction: u64,
    pub stack_pointer: u64,
    pub frame_address: Option<u64>,
    pub frame_name: Option<String>,
    pub registers: Vec<(&'static str, u64)>,
}

#[derive(Debug, Clone)]
pub struct ThreadReport {
    pub id: u64,
    pub frames: Vec<FrameReport>,
    pub error: Option<WalkError>,
}

#[derive(Debug, Clone)]
pub struct Report {
    pub arch: Architecture,
    pub threads: Vec<ThreadReport>,
}

impl ThreadReport {
    pub fn new(walker: &StackWalker<'_>, stack: CallStack) -> ThreadReport {
        let frames = stack
            .frames
            .iter()
            .map(|frame| FrameReport {
                state: frame.state(),
                instruction: frame.instruction_pointer(),
                stack_pointer: frame.stack_pointer(),
                frame_address: frame.frame_address(),
                frame_name: frame
                    .frame_address()
                    .map(|address| walker.frame_name(address)),
                registers: frame.context().registers(),
            })
            .collect();
        ThreadReport {
            id: stack.thread_id,
            frames,
            error: stack.error,
        }
    }
}

fn json_hex(value: u64) -> String {
    format!("{value:#x}")
}

impl Report {
    /// Whether every walk ran to completion.
    pub fn succeeded(&self) -> bool {
        self.threads.iter().all(|thread| thread.error.is_none())
    }

    /// Write a human-readable report to `f`.
    pub fn print<T: Write>(&self, f: &mut T) -> io::Result<()> {
        writeln!(f, "CPU: {}", self.arch)?;
        for thread in &self.threads {
            writeln!(f)?;
            writeln!(f, "Thread {}", thread.id)?;
            for (index, frame) in thread.frames.iter().enumerate() {
                write!(
                    f,
                    "{:2}  {:<13} ip {:#018x}  sp {:#018x}",
                    index,
                    frame.state.name(),
                    frame.instruction,
                    frame.stack_pointer
                )?;
                if let Some(address) = frame.frame_address {
                    write!(f, "  frame {address:#018x}")?;
                    if let Some(name) = &frame.frame_name {
                        write!(f, " ({name})")?;
                    }
                }
                writeln!(f)?;
            }
            if thread.frames.is_empty() {
                writeln!(f, "    <no frames>")?;
            }
            if let Some(error) = &thread.error {
                writeln!(f, "    error: {} - {}", error.name(), error)?;
            }
        }
        Ok(())
    }

    pub fn print_json<T: Write>(&self, f: &mut T, pretty: bool) -> Result<(), serde_json::Error> {
        let threads: Vec<_> = self
            .threads
            .iter()
            .map(|thread| {
                json!({
                    "id": thread.id,
                    "frames": thread.frames.iter().map(|frame| {
                        let registers: serde_json::Map<String, serde_json::Value> = frame
                            .registers
                            .iter()
                            .map(|&(name, value)| (String::from(name), json!(json_hex(value))))
                            .collect();
                        json!({
                            "state": frame.state,
                            "instruction": json_hex(frame.instruction),
                            "stack_pointer": json_hex(frame.stack_pointer),
                            "frame_address": frame.frame_address.map(json_hex),
                            "frame_name": frame.frame_name,
                            "registers": registers,
                        })
                    }).collect::<Vec<_>>(),
                    "error": thread.error.as_ref().map(|error| json!({
                        "name": error.name(),
                        "message": error.to_string(),
                    })),
                })
            })
            .collect();
        let output = json!({
            "arch": self.arch,
            "threads": threads,
        });

        if pretty {
            serde_json::to_writer_pretty(&mut *f, &output)?;
        } else {
            serde_json::to_writer(&mut *f, &output)?;
        }
        writeln!(f).map_err(serde_json::Error::io)
    }
}

//! Replays a recorded instrumentation trace through the attribution
//! engine. In production the events come straight from the host DBI
//! framework; a trace file is the development stand-in.
//!
//! One directive per line, `#` starts a comment. Thread ids are decimal,
//! every other number is hex (a leading `0x` is accepted):
//!
//! ```text
//! image /usr/bin/app main
//! section .text
//! rtn 1000 main
//! endimage
//! mem 7000 table
//! enter 0 1000
//! read 0 1004 2000
//! exit 0 1000
//! fini 0
//! ```

use simple_error::{bail, try_with};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::dbi::{AccessKind, Image, Routine, Section, TargetMemory};
use crate::instrument::Instrumentation;
use crate::result::Result;

/// Target memory seeded from `mem` directives. Strings get a trailing
/// NUL so the beacon hook finds a terminator.
#[derive(Default)]
pub struct ReplayMemory {
    regions: Vec<(u64, Vec<u8>)>,
}

impl ReplayMemory {
    pub fn new() -> ReplayMemory {
        ReplayMemory::default()
    }

    pub fn insert(&mut self, addr: u64, bytes: Vec<u8>) {
        self.regions.push((addr, bytes));
    }
}

impl TargetMemory for ReplayMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        for (start, bytes) in &self.regions {
            let end = start + bytes.len() as u64;
            if *start <= addr && addr < end {
                let offset = (addr - start) as usize;
                let n = buf.len().min(bytes.len() - offset);
                buf[..n].copy_from_slice(&bytes[offset..offset + n]);
                return Ok(n);
            }
        }
        bail!("no region maps {:#x}", addr)
    }
}

struct ImageBuilder {
    image: Image,
    sections: Vec<Section>,
}

pub fn run(path: &Path, tool: &Instrumentation) -> Result<()> {
    let file = try_with!(File::open(path), "cannot open trace {}", path.display());
    let mut memory = ReplayMemory::new();
    let mut building: Option<ImageBuilder> = None;

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = try_with!(line, "cannot read from {}", path.display());
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        try_with!(
            step(line, tool, &mut memory, &mut building),
            "line {}: {}",
            index + 1,
            line
        );
    }
    if building.is_some() {
        bail!("unterminated image block in {}", path.display());
    }
    Ok(())
}

fn step(
    line: &str,
    tool: &Instrumentation,
    memory: &mut ReplayMemory,
    building: &mut Option<ImageBuilder>,
) -> Result<()> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    match fields[0] {
        "image" => {
            if building.is_some() {
                bail!("nested image block");
            }
            let path = field(&fields, 1)?;
            *building = Some(ImageBuilder {
                image: Image {
                    path: path.to_string(),
                    main_executable: fields[2..].contains(&"main"),
                    interpreter: fields[2..].contains(&"interp"),
                },
                sections: vec![],
            });
        }
        "section" => {
            let name = field(&fields, 1)?;
            let builder = require_image(building)?;
            builder.sections.push(Section {
                name: name.to_string(),
                routines: vec![],
            });
        }
        "rtn" => {
            let address = parse_hex(field(&fields, 1)?)?;
            let name = field(&fields, 2)?;
            let builder = require_image(building)?;
            if builder.sections.is_empty() {
                builder.sections.push(Section {
                    name: ".text".to_string(),
                    routines: vec![],
                });
            }
            if let Some(section) = builder.sections.last_mut() {
                section.routines.push(Routine {
                    address,
                    name: name.to_string(),
                });
            }
        }
        "endimage" => match building.take() {
            Some(builder) => tool.image_load(&builder.image, &builder.sections),
            None => bail!("endimage without image"),
        },
        "mem" => {
            let addr = parse_hex(field(&fields, 1)?)?;
            let mut bytes = fields[2..].join(" ").into_bytes();
            bytes.push(0);
            memory.insert(addr, bytes);
        }
        "enter" => {
            let tid = parse_tid(field(&fields, 1)?)?;
            let addr = parse_hex(field(&fields, 2)?)?;
            let mut args = vec![];
            for arg in &fields[3..] {
                args.push(parse_hex(arg)?);
            }
            tool.routine_entry(tid, addr, &args, &*memory);
        }
        "exit" => {
            let tid = parse_tid(field(&fields, 1)?)?;
            let addr = parse_hex(field(&fields, 2)?)?;
            let ret = match fields.get(3) {
                Some(ret) => parse_hex(ret)?,
                None => 0,
            };
            tool.routine_exit(tid, addr, ret, &*memory);
        }
        "read" | "write" => {
            let tid = parse_tid(field(&fields, 1)?)?;
            let ip = parse_hex(field(&fields, 2)?)?;
            let ea = parse_hex(field(&fields, 3)?)?;
            let kind = if fields[0] == "read" {
                AccessKind::Read
            } else {
                AccessKind::Write
            };
            tool.memory_access(tid, ip, ea, kind);
        }
        "call" => {
            let tid = parse_tid(field(&fields, 1)?)?;
            let ip = parse_hex(field(&fields, 2)?)?;
            let target = parse_hex(field(&fields, 3)?)?;
            let file = field(&fields, 4)?;
            tool.call(tid, ip, target, file);
        }
        "fini" => {
            let code = match fields.get(1) {
                Some(code) => try_with!(code.parse::<i32>(), "not an exit code: {}", code),
                None => 0,
            };
            tool.finish(code);
        }
        other => bail!("unknown directive '{}'", other),
    }
    Ok(())
}

fn field<'a>(fields: &[&'a str], index: usize) -> Result<&'a str> {
    match fields.get(index) {
        Some(field) => Ok(*field),
        None => bail!("missing operand {}", index),
    }
}

fn require_image<'a>(building: &'a mut Option<ImageBuilder>) -> Result<&'a mut ImageBuilder> {
    match building.as_mut() {
        Some(builder) => Ok(builder),
        None => bail!("directive outside an image block"),
    }
}

fn parse_hex(s: &str) -> Result<u64> {
    let digits = s.trim_start_matches("0x");
    Ok(try_with!(
        u64::from_str_radix(digits, 16),
        "not a hex number: {}",
        s
    ))
}

fn parse_tid(s: &str) -> Result<u32> {
    Ok(try_with!(s.parse::<u32>(), "not a thread id: {}", s))
}

#[cfg(test)]
mod tests {
    use super::{run, ReplayMemory};
    use crate::classify::Classifier;
    use crate::dbi::TargetMemory;
    use crate::instrument::Instrumentation;
    use crate::logger::Logger;
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn tool() -> Instrumentation {
        Instrumentation::new(
            Classifier::new(),
            Arc::new(Logger::disabled()),
            PathBuf::from("baleen-report.log"),
        )
    }

    fn trace_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp trace");
        file.write_all(content.as_bytes()).expect("write trace");
        file
    }

    #[test]
    fn replay_memory_reads_across_region_bounds() {
        let mut mem = ReplayMemory::new();
        mem.insert(0x1000, vec![1, 2, 3, 4]);

        let mut buf = [0u8; 8];
        assert_eq!(mem.read(0x1002, &mut buf).expect("readable"), 2);
        assert_eq!(&buf[..2], &[3, 4]);
        assert!(mem.read(0x2000, &mut buf).is_err());
    }

    #[test]
    fn replays_a_whole_scenario() {
        let trace = trace_file(
            "# one allocation, one read, one write\n\
             image /usr/bin/app main\n\
             section .text\n\
             rtn 1000 _ZN3app3foo17h0123456789abcdefE\n\
             endimage\n\
             image /usr/lib/libc.so.6\n\
             rtn 9000 malloc\n\
             endimage\n\
             \n\
             enter 0 1000\n\
             enter 0 9000 40\n\
             exit 0 9000 10000\n\
             read 0 1010 10000\n\
             write 0 1014 10020\n\
             exit 0 1000\n",
        );

        let tool = tool();
        run(trace.path(), &tool).expect("replay");

        assert_eq!(tool.allocations().bytes().rust, 0x40);
        let counts = tool.objects().counts("0").expect("anonymous object");
        assert_eq!(counts.reads, [1, 0]);
        assert_eq!(counts.writes, [1, 0]);
    }

    #[test]
    fn beacon_names_come_from_seeded_memory() {
        let trace = trace_file(
            "image /usr/bin/app main\n\
             rtn 1300 baleen\n\
             endimage\n\
             mem 7000 table\n\
             enter 0 1300 2000 100 7000\n\
             exit 0 1300\n",
        );

        let tool = tool();
        run(trace.path(), &tool).expect("replay");
        assert!(tool.objects().counts("table").is_some());
    }

    #[test]
    fn errors_carry_the_line_number() {
        let trace = trace_file("image /usr/bin/app main\nendimage\nbogus 1 2 3\n");
        let err = match run(trace.path(), &tool()) {
            Err(err) => err.to_string(),
            Ok(()) => panic!("expected a parse error"),
        };
        assert!(err.contains("line 3"), "unexpected error: {}", err);
        assert!(err.contains("bogus"), "unexpected error: {}", err);
    }

    #[test]
    fn unterminated_image_blocks_are_rejected() {
        let trace = trace_file("image /usr/bin/app main\nrtn 1000 main\n");
        assert!(run(trace.path(), &tool()).is_err());
    }

    #[test]
    fn routines_outside_an_image_are_rejected() {
        let trace = trace_file("rtn 1000 main\n");
        assert!(run(trace.path(), &tool()).is_err());
    }
}

//! Map command-line line identifiers to a chip path and offsets.
//!
//! Identifiers are either line names or, when a chip is selected and name
//! lookup is not forced, numeric offsets on that chip. All resolved lines
//! must live on one chip.

use anyhow::{bail, Context, Result};
use gpio_cdev::Chip;
use std::path::{Path, PathBuf};

use crate::backend::cdev_to_io;

/// Directory holding GPIO character devices.
pub const DEV_DIR: &str = "/dev";

/// Lookup options taken from the global command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions<'a> {
    pub chip: Option<&'a str>,
    pub by_name: bool,
    pub strict: bool,
}

/// Line names of one chip, indexed by offset.
#[derive(Debug, Clone)]
pub struct ChipLines {
    pub path: String,
    pub names: Vec<Option<String>>,
}

/// Result of resolving a list of identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLines {
    pub chip_path: String,
    pub offsets: Vec<u32>,
}

/// Turn a chip identifier (`gpiochip0`, `0`, or a path) into a device path.
pub fn chip_path(id: &str) -> PathBuf {
    if id.contains('/') {
        PathBuf::from(id)
    } else if id.bytes().all(|b| b.is_ascii_digit()) {
        Path::new(DEV_DIR).join(format!("gpiochip{id}"))
    } else {
        Path::new(DEV_DIR).join(id)
    }
}

/// Resolve `ids` against the GPIO chips present on this system.
pub fn resolve_lines(ids: &[String], opts: ResolveOptions<'_>) -> Result<ResolvedLines> {
    let chips = match opts.chip {
        Some(id) => vec![read_chip(&chip_path(id))?],
        None => {
            let mut chips = Vec::new();
            for chip in gpio_cdev::chips().context("Failed to enumerate GPIO chips")? {
                let chip = chip.map_err(cdev_to_io).context("Failed to open GPIO chip")?;
                chips.push(read_chip_lines(chip)?);
            }
            chips
        }
    };

    resolve_in(&chips, ids, opts)
}

/// Resolve `ids` against an explicit chip inventory.
pub fn resolve_in(
    chips: &[ChipLines],
    ids: &[String],
    opts: ResolveOptions<'_>,
) -> Result<ResolvedLines> {
    if ids.is_empty() {
        bail!("At least one line must be specified");
    }

    let mut found: Vec<(usize, u32)> = Vec::with_capacity(ids.len());
    for id in ids {
        let by_offset = opts.chip.is_some() && !opts.by_name;
        match id.parse::<u32>() {
            Ok(offset) if by_offset => {
                let Some(chip) = chips.first() else {
                    bail!("no GPIO chip to resolve offset {} on", offset);
                };
                if offset as usize >= chip.names.len() {
                    bail!("offset {} is out of range on chip '{}'", offset, chip.path);
                }
                found.push((0, offset));
            }
            _ => found.push(find_by_name(chips, id, opts.strict)?),
        }
    }

    let chip_idx = found[0].0;
    if found.iter().any(|(idx, _)| *idx != chip_idx) {
        bail!("Can only manipulate lines from one chip at a time");
    }

    let mut offsets: Vec<u32> = Vec::with_capacity(found.len());
    for (id, (_, offset)) in ids.iter().zip(&found) {
        if offsets.contains(offset) {
            bail!("line '{}' was specified more than once", id);
        }
        offsets.push(*offset);
    }

    Ok(ResolvedLines {
        chip_path: chips[chip_idx].path.clone(),
        offsets,
    })
}

fn find_by_name(chips: &[ChipLines], name: &str, strict: bool) -> Result<(usize, u32)> {
    let mut matches = chips.iter().enumerate().flat_map(|(chip_idx, chip)| {
        chip.names
            .iter()
            .enumerate()
            .filter(move |(_, n)| n.as_deref() == Some(name))
            .map(move |(offset, _)| (chip_idx, offset as u32))
    });

    let Some(first) = matches.next() else {
        bail!("cannot find line '{}'", name);
    };
    if strict && matches.next().is_some() {
        bail!("line '{}' is not unique", name);
    }
    Ok(first)
}

fn read_chip(path: &Path) -> Result<ChipLines> {
    let chip = Chip::new(path)
        .map_err(cdev_to_io)
        .with_context(|| format!("cannot find GPIO chip '{}'", path.display()))?;
    read_chip_lines(chip)
}

fn read_chip_lines(mut chip: Chip) -> Result<ChipLines> {
    let path = chip.path().to_string_lossy().into_owned();
    let mut names = Vec::with_capacity(chip.num_lines() as usize);
    for offset in 0..chip.num_lines() {
        let info = chip
            .get_line(offset)
            .and_then(|line| line.info())
            .map_err(cdev_to_io)
            .with_context(|| format!("Failed to read line {} info on '{}'", offset, path))?;
        names.push(info.name().map(str::to_owned));
    }
    Ok(ChipLines { path, names })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory() -> Vec<ChipLines> {
        vec![
            ChipLines {
                path: "/dev/gpiochip0".into(),
                names: vec![Some("led0".into()), None, Some("button".into()), Some("dup".into())],
            },
            ChipLines {
                path: "/dev/gpiochip1".into(),
                names: vec![Some("relay".into()), Some("dup".into())],
            },
        ]
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_chip_path_forms() {
        assert_eq!(chip_path("0"), PathBuf::from("/dev/gpiochip0"));
        assert_eq!(chip_path("gpiochip3"), PathBuf::from("/dev/gpiochip3"));
        assert_eq!(chip_path("/dev/gpiochip2"), PathBuf::from("/dev/gpiochip2"));
    }

    #[test]
    fn test_offsets_on_selected_chip() {
        let chips = &inventory()[..1];
        let opts = ResolveOptions {
            chip: Some("0"),
            ..Default::default()
        };
        let resolved = resolve_in(chips, &ids(&["2", "0"]), opts).unwrap();
        assert_eq!(resolved.chip_path, "/dev/gpiochip0");
        assert_eq!(resolved.offsets, vec![2, 0]);
    }

    #[test]
    fn test_offset_out_of_range() {
        let chips = &inventory()[..1];
        let opts = ResolveOptions {
            chip: Some("0"),
            ..Default::default()
        };
        assert!(resolve_in(chips, &ids(&["4"]), opts).is_err());
    }

    #[test]
    fn test_names_across_chips() {
        let resolved =
            resolve_in(&inventory(), &ids(&["relay"]), ResolveOptions::default()).unwrap();
        assert_eq!(resolved.chip_path, "/dev/gpiochip1");
        assert_eq!(resolved.offsets, vec![0]);
    }

    #[test]
    fn test_lines_on_two_chips_rejected() {
        let err = resolve_in(&inventory(), &ids(&["led0", "relay"]), ResolveOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("one chip"));
    }

    #[test]
    fn test_strict_rejects_duplicate_names() {
        let lax = resolve_in(&inventory(), &ids(&["dup"]), ResolveOptions::default()).unwrap();
        assert_eq!(lax.offsets, vec![3]);

        let strict = ResolveOptions {
            strict: true,
            ..Default::default()
        };
        assert!(resolve_in(&inventory(), &ids(&["dup"]), strict).is_err());
    }

    #[test]
    fn test_numeric_ids_without_chip_are_names() {
        assert!(resolve_in(&inventory(), &ids(&["2"]), ResolveOptions::default()).is_err());
    }

    #[test]
    fn test_repeated_line_rejected() {
        let err = resolve_in(&inventory(), &ids(&["led0", "led0"]), ResolveOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_empty_ids_rejected() {
        assert!(resolve_in(&inventory(), &[], ResolveOptions::default()).is_err());
    }
}

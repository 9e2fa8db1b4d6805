//! Memory image comparison between two checkpoints.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Block granularity of memory differences.
pub const DEFAULT_BLOCK_SIZE: u64 = 8192;

const IMAGE_EXTENSIONS: [&str; 3] = ["craff", "raw", "img"];

/// A block of a memory image that differs from the gold run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryDiff {
    /// File name of the image inside the checkpoint.
    pub image: String,
    /// Byte offset of the block within the image.
    pub block: u64,
}

fn is_memory_image(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| IMAGE_EXTENSIONS.contains(&e))
}

/// Fills `buffer` as far as the reader allows and returns the bytes read.
fn read_block(reader: &mut impl Read, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Compares one image block by block.
pub fn compare_image(gold: &Path, monitored: &Path, block_size: u64) -> Result<Vec<u64>> {
    let open = |path: &Path| File::open(path).map(BufReader::new).map_err(|e| Error::file(path, e));
    let mut gold_reader = open(gold)?;
    let mut monitored_reader = open(monitored)?;
    let size = block_size.max(1) as usize;
    let mut gold_block = vec![0u8; size];
    let mut monitored_block = vec![0u8; size];

    let mut blocks = Vec::new();
    let mut offset = 0u64;
    loop {
        let gold_len = read_block(&mut gold_reader, &mut gold_block).map_err(|e| Error::file(gold, e))?;
        let monitored_len =
            read_block(&mut monitored_reader, &mut monitored_block).map_err(|e| Error::file(monitored, e))?;
        if gold_len == 0 && monitored_len == 0 {
            break;
        }
        if gold_block[..gold_len] != monitored_block[..monitored_len] {
            blocks.push(offset);
        }
        offset += size as u64;
    }
    Ok(blocks)
}

/// Lists the differing blocks of every memory image of the gold checkpoint.
///
/// Images are compared as stored. Offsets are physical addresses for raw
/// images; for compressed images they only locate the change in the file.
pub fn compare_memory(gold: &Path, monitored: &Path, block_size: u64) -> Result<Vec<MemoryDiff>> {
    let mut images: Vec<_> = fs::read_dir(gold)
        .map_err(|e| Error::file(gold, e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| is_memory_image(path))
        .collect();
    images.sort();

    let mut diffs = Vec::new();
    for image in images {
        let Some(name) = image.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let blocks = compare_image(&image, &monitored.join(&name), block_size)?;
        debug!("{} blocks of {} differ", blocks.len(), name);
        diffs.extend(blocks.into_iter().map(|block| MemoryDiff {
            image: name.clone(),
            block,
        }));
    }
    Ok(diffs)
}

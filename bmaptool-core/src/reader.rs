//! Parsing and validation of bmap XML documents.
//!
//! Parsing fails with [`Error::MalformedDocument`] when the text is not a bmap
//! document this crate understands (bad XML, missing elements, unknown format
//! major version, unknown checksum type) and with
//! [`Error::InconsistentDocument`] when it parses but its values contradict
//! each other. Unknown elements and attributes are ignored.

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use tracing::debug;

use crate::checksum::{self, ChecksumAlgorithm, Digest};
use crate::document::{BmapDocument, Range, Version};
use crate::error::{Error, Result};
use crate::writer::{self, FILE_CHECKSUM_TAG, FILE_SHA1_TAG};

const BLOCK_MAP_PATH: &[&[u8]] = &[b"bmap", b"BlockMap"];

fn malformed(msg: impl Into<String>) -> Error {
    Error::MalformedDocument(msg.into())
}

/// A `<Range>` element before its text is interpreted.
#[derive(Default)]
struct RawRange {
    text: String,
    digest: Option<String>,
}

/// Element values as they appear in the document.
#[derive(Default)]
struct RawFields {
    version: Option<Version>,
    image_size: Option<String>,
    block_size: Option<String>,
    blocks_count: Option<String>,
    mapped_blocks_count: Option<String>,
    checksum_type: Option<String>,
    image_checksum: Option<String>,
    file_checksum: Option<String>,
    file_sha1: Option<String>,
    ranges: Vec<RawRange>,
}

/// Parses and validates a serialized document.
pub fn parse(bytes: &[u8]) -> Result<BmapDocument> {
    let text = std::str::from_utf8(bytes).map_err(|e| malformed(format!("Not UTF-8: {e}")))?;
    parse_str(text)
}

pub fn parse_str(text: &str) -> Result<BmapDocument> {
    let fields = scan(text)?;

    let version = fields
        .version
        .ok_or_else(|| malformed("Missing bmap format version"))?;
    if !version.is_supported() {
        return Err(malformed(format!(
            "Unsupported bmap format version {version}, the highest supported is {}.x",
            Version::MAX_MAJOR,
        )));
    }

    let algorithm = if version.has_checksum_type() {
        fields
            .checksum_type
            .as_deref()
            .map(str::parse::<ChecksumAlgorithm>)
            .transpose()?
    } else {
        Some(ChecksumAlgorithm::Sha1)
    };

    let block_size = number::<u32>(&fields.block_size, "BlockSize")?;
    let image_size = number::<u64>(&fields.image_size, "ImageSize")?;
    let total_blocks = number::<u64>(&fields.blocks_count, "BlocksCount")?;
    let mapped_block_count = number::<u64>(&fields.mapped_blocks_count, "MappedBlocksCount")?;

    let digest = |hex_value: &str| -> Result<Digest> {
        let algorithm =
            algorithm.ok_or_else(|| malformed("Digest present, but no ChecksumType given"))?;
        Digest::from_hex(algorithm, hex_value)
    };

    let ranges = fields
        .ranges
        .iter()
        .map(|raw| {
            let mut range = parse_range_text(&raw.text)?;
            range.checksum = raw.digest.as_deref().map(digest).transpose()?;
            Ok(range)
        })
        .collect::<Result<Vec<_>>>()?;

    let image_checksum = fields.image_checksum.as_deref().map(digest).transpose()?;

    if let Some(recorded) = &fields.file_checksum {
        verify_file_checksum(text, FILE_CHECKSUM_TAG, digest(recorded)?)?;
    } else if let Some(recorded) = &fields.file_sha1 {
        let recorded = Digest::from_hex(ChecksumAlgorithm::Sha1, recorded)?;
        verify_file_checksum(text, FILE_SHA1_TAG, recorded)?;
    }

    let doc = BmapDocument::from_parts(
        version,
        block_size,
        image_size,
        total_blocks,
        mapped_block_count,
        ranges,
        image_checksum,
    )?;

    debug!(
        %version,
        block_size,
        total_blocks,
        mapped_block_count,
        ranges = doc.ranges().len(),
        "Parsed bmap document",
    );

    Ok(doc)
}

/// Walks the XML and collects the raw text of every element we know.
fn scan(text: &str) -> Result<RawFields> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut fields = RawFields::default();
    let mut path: Vec<Vec<u8>> = vec![];
    let mut seen_root = false;

    loop {
        let event = reader.read_event().map_err(|e| {
            malformed(format!(
                "XML error at byte {}: {e}",
                reader.buffer_position()
            ))
        })?;

        match event {
            Event::Start(e) if path.is_empty() => {
                read_root(&e, &mut fields, &mut seen_root)?;
                path.push(e.name().as_ref().to_vec());
            }
            Event::Empty(e) if path.is_empty() => {
                read_root(&e, &mut fields, &mut seen_root)?;
            }
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                if name == b"Range" && path_is(&path, BLOCK_MAP_PATH) {
                    fields.ranges.push(RawRange {
                        text: String::new(),
                        digest: range_digest(&e, fields.version)?,
                    });
                }
                path.push(name);
            }
            Event::Empty(e) => {
                // A range with no text fails later when its text is parsed.
                if e.name().as_ref() == b"Range" && path_is(&path, BLOCK_MAP_PATH) {
                    fields.ranges.push(RawRange {
                        text: String::new(),
                        digest: range_digest(&e, fields.version)?,
                    });
                }
            }
            Event::Text(t) => {
                let value = t
                    .unescape()
                    .map_err(|e| malformed(format!("Bad text: {e}")))?
                    .into_owned();

                match path.as_slice() {
                    [root, elem] if root == b"bmap" => {
                        let slot = match elem.as_slice() {
                            b"ImageSize" => &mut fields.image_size,
                            b"BlockSize" => &mut fields.block_size,
                            b"BlocksCount" => &mut fields.blocks_count,
                            b"MappedBlocksCount" => &mut fields.mapped_blocks_count,
                            b"ChecksumType" => &mut fields.checksum_type,
                            b"ImageChecksum" => &mut fields.image_checksum,
                            b"BmapFileChecksum" => &mut fields.file_checksum,
                            b"BmapFileSHA1" => &mut fields.file_sha1,
                            _ => continue,
                        };
                        *slot = Some(value);
                    }
                    [root, map, range] if root == b"bmap" && map == b"BlockMap" && range == b"Range" => {
                        if let Some(raw) = fields.ranges.last_mut() {
                            raw.text.push_str(&value);
                        }
                    }
                    _ => {}
                }
            }
            Event::End(_) => {
                path.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !seen_root {
        return Err(malformed("No <bmap> element"));
    }

    Ok(fields)
}

fn read_root(e: &BytesStart<'_>, fields: &mut RawFields, seen_root: &mut bool) -> Result<()> {
    if *seen_root {
        return Err(malformed("Multiple root elements"));
    } else if e.name().as_ref() != b"bmap" {
        return Err(malformed(format!(
            "Root element is <{}>, not <bmap>",
            String::from_utf8_lossy(e.name().as_ref()),
        )));
    }
    *seen_root = true;

    let version = attribute(e, b"version")?
        .ok_or_else(|| malformed("<bmap> has no version attribute"))?;
    fields.version = Some(version.parse()?);

    Ok(())
}

fn path_is(path: &[Vec<u8>], expected: &[&[u8]]) -> bool {
    path.len() == expected.len() && path.iter().zip(expected).all(|(a, b)| a == b)
}

fn attribute(e: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|err| malformed(format!("Bad attribute: {err}")))?;
        if attr.key.as_ref() == key {
            let value = attr
                .unescape_value()
                .map_err(|err| malformed(format!("Bad attribute value: {err}")))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Format 1.4 and later store range digests in `chksum`; older documents use
/// `sha1`.
fn range_digest(e: &BytesStart<'_>, version: Option<Version>) -> Result<Option<String>> {
    let key: &[u8] = match version {
        Some(v) if !v.has_checksum_type() => b"sha1",
        _ => b"chksum",
    };
    attribute(e, key)
}

fn number<T: std::str::FromStr>(value: &Option<String>, name: &str) -> Result<T> {
    let value = value
        .as_deref()
        .ok_or_else(|| malformed(format!("Missing <{name}>")))?;
    value
        .trim()
        .parse()
        .map_err(|_| malformed(format!("Invalid <{name}>: {value:?}")))
}

/// Parses `first-last` (inclusive) or a single block number.
fn parse_range_text(text: &str) -> Result<Range> {
    let parse = |s: &str| {
        s.trim()
            .parse::<u64>()
            .map_err(|_| malformed(format!("Invalid range: {text:?}")))
    };

    let (first, last) = match text.split_once('-') {
        Some((first, last)) => (parse(first)?, parse(last)?),
        None => {
            let block = parse(text)?;
            (block, block)
        }
    };

    if last < first {
        return Err(Error::InconsistentDocument(format!(
            "Range {first}-{last} ends before it starts"
        )));
    }

    Ok(Range::new(first, last - first + 1))
}

/// Checks the self-checksum: a digest of the document with the value of the
/// checksum element replaced by zeros.
fn verify_file_checksum(text: &str, tag: &str, recorded: Digest) -> Result<()> {
    let (start, end) = writer::element_value(text, tag)
        .ok_or_else(|| malformed(format!("Cannot locate <{tag}>")))?;

    let mut zeroed = text.to_owned();
    zeroed.replace_range(start..end, &"0".repeat(end - start));

    let actual = checksum::digest_bytes(recorded.algorithm(), zeroed.as_bytes());
    if actual != recorded {
        return Err(Error::InconsistentDocument(format!(
            "Document checksum mismatch: recorded {recorded}, computed {actual}"
        )));
    }

    Ok(())
}

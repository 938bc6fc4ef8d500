//! Serialization of a [`BmapDocument`] to the bmap XML format.
//!
//! The output is canonical: the same document always produces the same bytes,
//! since signatures and the embedded self-checksum are computed over them.

use std::fmt::{self, Write as _};
use std::io::{self, Write};

use crate::checksum::{self, ChecksumAlgorithm};
use crate::document::BmapDocument;

pub(crate) const FILE_CHECKSUM_TAG: &str = "BmapFileChecksum";
pub(crate) const FILE_SHA1_TAG: &str = "BmapFileSHA1";

/// Serializes `doc`, filling in the document self-checksum when the document
/// has a checksum algorithm.
pub fn to_string(doc: &BmapDocument) -> String {
    let mut out = String::new();
    render(&mut out, doc).expect("formatting into a String cannot fail");

    if let Some(algorithm) = file_checksum_algorithm(doc) {
        fill_file_checksum(&mut out, algorithm);
    }

    out
}

fn file_checksum_algorithm(doc: &BmapDocument) -> Option<ChecksumAlgorithm> {
    doc.checksum_algorithm()
        .filter(|_| doc.version().has_checksum_type())
}

fn render(out: &mut String, doc: &BmapDocument) -> fmt::Result {
    let version = doc.version();
    let digest_attr = if version.has_checksum_type() {
        "chksum"
    } else {
        "sha1"
    };

    write_header(out, doc)?;

    writeln!(out, "<bmap version=\"{version}\">")?;
    writeln!(out, "    <ImageSize> {} </ImageSize>", doc.image_size())?;
    writeln!(out, "    <BlockSize> {} </BlockSize>", doc.block_size())?;
    writeln!(out, "    <BlocksCount> {} </BlocksCount>", doc.total_blocks())?;
    writeln!(
        out,
        "    <MappedBlocksCount> {} </MappedBlocksCount>",
        doc.mapped_block_count(),
    )?;
    if let Some(algorithm) = file_checksum_algorithm(doc) {
        writeln!(out, "    <ChecksumType> {algorithm} </ChecksumType>")?;
    }
    if let Some(digest) = doc.image_checksum() {
        writeln!(out, "    <ImageChecksum> {} </ImageChecksum>", digest.to_hex())?;
    }
    if let Some(algorithm) = file_checksum_algorithm(doc) {
        let zeros = "0".repeat(algorithm.output_len() * 2);
        writeln!(out, "    <{FILE_CHECKSUM_TAG}> {zeros} </{FILE_CHECKSUM_TAG}>")?;
    }

    writeln!(out, "    <BlockMap>")?;
    for range in doc.ranges() {
        write!(out, "        <Range")?;
        if let Some(digest) = &range.checksum {
            write!(out, " {digest_attr}=\"{}\"", digest.to_hex())?;
        }
        if range.block_count == 1 {
            writeln!(out, "> {} </Range>", range.start_block)?;
        } else {
            writeln!(out, "> {}-{} </Range>", range.start_block, range.last_block())?;
        }
    }
    writeln!(out, "    </BlockMap>")?;
    writeln!(out, "</bmap>")
}

/// Writes the serialized document to `writer`.
pub fn write(doc: &BmapDocument, mut writer: impl Write) -> io::Result<()> {
    writer.write_all(to_string(doc).as_bytes())?;
    writer.flush()
}

fn write_header(out: &mut String, doc: &BmapDocument) -> fmt::Result {
    let total = doc.total_blocks();
    let mapped = doc.mapped_block_count();
    let permille = (u128::from(mapped) * 1000)
        .checked_div(u128::from(total))
        .unwrap_or(0);

    writeln!(out, "<?xml version=\"1.0\" ?>")?;
    writeln!(
        out,
        "<!-- Block map of an image of {} bytes. {mapped} of {total} blocks of {} bytes \
         ({}.{}%) hold data. Only those need to be copied; the rest are holes. -->",
        doc.image_size(),
        doc.block_size(),
        permille / 10,
        permille % 10,
    )?;
    writeln!(out)
}

/// Replaces the zero placeholder of the self-checksum element with the digest
/// of the whole document as it looks with the placeholder in place.
fn fill_file_checksum(out: &mut String, algorithm: ChecksumAlgorithm) {
    let Some((start, end)) = element_value(out, FILE_CHECKSUM_TAG) else {
        return;
    };
    let digest = checksum::digest_bytes(algorithm, out.as_bytes());
    out.replace_range(start..end, &digest.to_hex());
}

/// Byte range of the trimmed text inside the first `<tag>...</tag>` element.
pub(crate) fn element_value(text: &str, tag: &str) -> Option<(usize, usize)> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");

    let inner_start = text.find(&open)? + open.len();
    let inner_end = inner_start + text[inner_start..].find(&close)?;
    let inner = &text[inner_start..inner_end];

    let lead = inner.len() - inner.trim_start().len();
    let value_len = inner.trim().len();

    Some((inner_start + lead, inner_start + lead + value_len))
}

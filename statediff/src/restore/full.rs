use crate::{
    error::{Error, Result},
    restore::{index_diffs, parse_sections},
};

/// Full-mode restart: the target diff is the whole region.
pub(crate) fn restart_full(diffs: &[Vec<u8>], target_id: u32) -> Result<Vec<u8>> {
    let by_id = index_diffs(diffs)?;
    let diff = by_id
        .get(&target_id)
        .ok_or_else(|| Error::Config(format!("target snapshot {target_id} not provided")))?;
    let sections = parse_sections(diff)?;
    if sections.payload.len() as u64 != sections.header.datalen {
        return Err(Error::Format(format!(
            "full diff payload is {} bytes, header declares {}",
            sections.payload.len(),
            sections.header.datalen
        )));
    }
    Ok(sections.payload.to_vec())
}

//! Splicing addon template references into a base list.

use crate::core::types::TemplateRef;

/// Insert `addon_refs` into `base`.
///
/// An anchored ref whose anchor is already in the working list lands right
/// before or after it; bare refs and refs with a missing anchor append. The
/// working list includes refs placed earlier in the same call, so one addon
/// may anchor on another.
pub fn merge(base: &[TemplateRef], addon_refs: &[TemplateRef]) -> Vec<TemplateRef> {
    let mut merged: Vec<TemplateRef> = base.to_vec();
    for addon in addon_refs {
        let position = match addon {
            TemplateRef::Name(_) => None,
            TemplateRef::Anchored { before, after, .. } => {
                let find = |anchor: &str| merged.iter().position(|r| r.name() == anchor);
                before
                    .as_deref()
                    .and_then(find)
                    .or_else(|| after.as_deref().and_then(find).map(|idx| idx + 1))
            }
        };
        match position {
            Some(idx) => merged.insert(idx, addon.clone()),
            None => {
                tracing::debug!(template = addon.name(), "addon ref appended");
                merged.push(addon.clone());
            }
        }
    }
    merged
}

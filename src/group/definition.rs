//! From a design document to a group of spatial indices.
//!
//! A design document names several spatial indices; indices with identical
//! function bodies share one tree. The deduplicated bodies are sorted to
//! assign stable `id_num`s, and the group's 16-byte signature is a digest
//! over everything that affects index content, so any definition change
//! lands in a different index file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::errors::{SpatialError, SpatialResult};

/// A design document as stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignDoc {
    pub id: String,
    pub language: String,
    /// Index name to spatial function body.
    pub indices: BTreeMap<String, String>,
    pub options: BTreeMap<String, String>,
}

/// One deduplicated spatial index: a function body, the names pointing at
/// it, and its position among the group's trees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub id_num: usize,
    pub body: String,
    pub names: Vec<String>,
}

/// The resolved definition of a spatial group.
#[derive(Debug, Clone)]
pub struct GroupDef {
    pub db_name: String,
    pub design_id: String,
    pub language: String,
    pub options: BTreeMap<String, String>,
    pub indices: Vec<IndexDef>,
    pub signature: [u8; 16],
}

impl GroupDef {
    pub fn from_design(db_name: impl Into<String>, design: &DesignDoc) -> SpatialResult<GroupDef> {
        let mut by_body: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for (name, body) in &design.indices {
            by_body.entry(body.as_str()).or_default().push(name.clone());
        }
        let indices: Vec<IndexDef> = by_body
            .into_iter()
            .enumerate()
            .map(|(id_num, (body, names))| IndexDef {
                id_num,
                body: body.to_string(),
                names,
            })
            .collect();
        let signature = compute_signature(&indices, &design.language, &design.options)?;

        Ok(GroupDef {
            db_name: db_name.into(),
            design_id: design.id.clone(),
            language: design.language.clone(),
            options: design.options.clone(),
            indices,
            signature,
        })
    }

    /// Looks an index up by any of its declared names.
    pub fn index_by_name(&self, name: &str) -> Option<&IndexDef> {
        self.indices
            .iter()
            .find(|def| def.names.iter().any(|n| n == name))
    }

    pub fn hex_signature(&self) -> String {
        self.signature.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// `<root_dir>/<db_name>_design/<hex(signature)>.spatial`
    pub fn file_path(&self, root_dir: &Path) -> PathBuf {
        root_dir
            .join(format!("{}_design", self.db_name))
            .join(format!("{}.spatial", self.hex_signature()))
    }
}

fn compute_signature(
    indices: &[IndexDef],
    language: &str,
    options: &BTreeMap<String, String>,
) -> SpatialResult<[u8; 16]> {
    let payload = bincode::serde::encode_to_vec(
        (indices, language, options),
        bincode::config::legacy(),
    )
    .map_err(|e| SpatialError::Codec(e.to_string()))?;
    Ok(Md5::digest(&payload).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn design(indices: &[(&str, &str)]) -> DesignDoc {
        DesignDoc {
            id: "_design/geo".into(),
            language: "javascript".into(),
            indices: indices
                .iter()
                .map(|(n, b)| (n.to_string(), b.to_string()))
                .collect(),
            options: BTreeMap::new(),
        }
    }

    #[test]
    fn test_identical_bodies_share_an_index() {
        let def = GroupDef::from_design(
            "places",
            &design(&[("by_loc", "emit(bbox)"), ("by_loc2", "emit(bbox)"), ("other", "emit(x)")]),
        )
        .unwrap();

        assert_eq!(def.indices.len(), 2);
        let shared = def.index_by_name("by_loc").unwrap();
        assert_eq!(shared.names, vec!["by_loc", "by_loc2"]);
        assert_eq!(
            def.index_by_name("by_loc2").unwrap().id_num,
            shared.id_num
        );
        assert!(def.index_by_name("missing").is_none());
    }

    #[test]
    fn test_id_nums_follow_sorted_bodies() {
        let def = GroupDef::from_design(
            "places",
            &design(&[("z_name", "aaa"), ("a_name", "zzz")]),
        )
        .unwrap();
        // Bodies sort, not names.
        assert_eq!(def.indices[0].body, "aaa");
        assert_eq!(def.indices[0].id_num, 0);
        assert_eq!(def.indices[1].body, "zzz");
        assert_eq!(def.indices[1].id_num, 1);
    }

    #[test]
    fn test_signature_tracks_definition_content() {
        let base = GroupDef::from_design("db", &design(&[("a", "body1")])).unwrap();
        let same = GroupDef::from_design("db", &design(&[("a", "body1")])).unwrap();
        assert_eq!(base.signature, same.signature);

        let new_body = GroupDef::from_design("db", &design(&[("a", "body2")])).unwrap();
        assert_ne!(base.signature, new_body.signature);

        let mut other_lang = design(&[("a", "body1")]);
        other_lang.language = "erlang".into();
        let other_lang = GroupDef::from_design("db", &other_lang).unwrap();
        assert_ne!(base.signature, other_lang.signature);

        let mut with_options = design(&[("a", "body1")]);
        with_options
            .options
            .insert("collation".into(), "raw".into());
        let with_options = GroupDef::from_design("db", &with_options).unwrap();
        assert_ne!(base.signature, with_options.signature);
    }

    #[test]
    fn test_file_path_layout() {
        let def = GroupDef::from_design("places", &design(&[("a", "b")])).unwrap();
        let path = def.file_path(Path::new("/var/idx"));
        let expected = format!("/var/idx/places_design/{}.spatial", def.hex_signature());
        assert_eq!(path, PathBuf::from(expected));
        assert_eq!(def.hex_signature().len(), 32);
    }
}

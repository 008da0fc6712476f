//! C3: the schema provider.
//!
//! The core never bakes in a client version's property layout. Instead it asks a
//! [`SchemaProvider`] for the named constant tables and entity definitions it needs,
//! keeping schema resolution behind a trait so a client-version bump only means loading
//! different assets, not recompiling the decoder. `JsonSchemaProvider` is a demo
//! implementation backed by embedded JSON/XML assets; production deployments can supply
//! their own provider.

use rust_embed::RustEmbed;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;

use crate::error::ReplayError;

/// A single property or method argument codec. The wire format only needs to know how
/// many bytes (or what shape) to consume; it never needs to know the semantic type.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldCodec {
    pub name: String,
    pub kind: FieldKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    U8,
    U16,
    U32,
    U64,
    I32,
    F32,
    String,
    Blob,
    Pickle,
    Fixed(u32),
}

/// A method's ordered argument list. Methods are multi-arg (e.g.
/// `onArenaStateReceived(arenaUniqueId, teamBuildTypeId, preBattlesInfo, ...)`), unlike
/// properties which decode to a single value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MethodDef {
    pub name: String,
    #[serde(default)]
    pub args: Vec<FieldCodec>,
}

/// An entity type's ordered property and method codec lists. Index position is the sole
/// source of truth for decoding order — there is no name-based lookup at decode time.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntityDef {
    pub name: String,
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub base_properties: Vec<FieldCodec>,
    #[serde(default)]
    pub client_properties: Vec<FieldCodec>,
    #[serde(default)]
    pub client_properties_internal: Vec<FieldCodec>,
    #[serde(default)]
    pub cell_properties: Vec<FieldCodec>,
    #[serde(default)]
    pub methods: Vec<MethodDef>,
}

/// Named constant tables: finish reasons, battle types, death reasons, the various
/// `*_RESULTS` field-name lists used to zip battle-results arrays, and so on.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Constants {
    pub tables: HashMap<String, JsonValue>,
}

impl Constants {
    pub fn table(&self, name: &str) -> Option<&JsonValue> {
        self.tables.get(name)
    }

    /// Looks up an ordered field-name list, used to zip battle-results arrays
    /// positionally (`PLAYER_PRIVATE_RESULTS`, `COMMON_RESULTS`, ...).
    pub fn field_list(&self, name: &str) -> Option<Vec<String>> {
        self.tables.get(name).and_then(|v| v.as_array()).map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
    }

    /// Looks up a scalar-value lookup table (e.g. `FINISH_REASONS: {"1": "Sunk", ...}`).
    pub fn lookup(&self, table: &str, key: &str) -> Option<String> {
        self.tables
            .get(table)
            .and_then(|v| v.get(key))
            .and_then(|v| v.as_str())
            .map(str::to_owned)
    }

    /// Looks up a table entry that is itself an object (`DEATH_REASONS`, `BATTLE_TYPES`),
    /// for callers that need more than one field out of it.
    pub fn object(&self, table: &str, key: &str) -> Option<&JsonValue> {
        self.tables.get(table)?.get(key)
    }

    /// A `{"<numeric index>": "fieldName", ...}` table, e.g. `PLAYER_NUM_MEMBER_MAP`.
    pub fn numeric_map(&self, name: &str) -> Option<HashMap<String, String>> {
        self.tables.get(name)?.as_object().map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
    }

    /// An ordered field-name list nested one level down (`SHARED_DATA_CONSTANTS.CLIENT_BUILDING_DATA`).
    pub fn nested_field_list(&self, parent: &str, child: &str) -> Option<Vec<String>> {
        self.tables
            .get(parent)?
            .get(child)?
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
    }

    /// True if a table by this name (case sensitive) exists, used to decide whether a
    /// battle-results field needs a further positional expansion.
    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }
}

/// Everything a replay needs for one client version: named constants and entity
/// definitions addressable by name or compact numeric index.
pub struct Definitions {
    pub constants: Constants,
    by_name: HashMap<String, EntityDef>,
    by_index: HashMap<u32, String>,
}

impl Definitions {
    pub fn get_entity_def_by_name(&self, name: &str) -> Result<&EntityDef, ReplayError> {
        self.by_name
            .get(name)
            .ok_or_else(|| ReplayError::SchemaError(format!("no entity definition named {}", name)))
    }

    pub fn get_entity_def_by_index(&self, index: u32) -> Result<&EntityDef, ReplayError> {
        let name = self.by_index.get(&index).ok_or_else(|| {
            ReplayError::SchemaError(format!("no entity definition at index {}", index))
        })?;
        self.get_entity_def_by_name(name)
    }
}

/// Resolves a client version string to its `Definitions`. Implementations are free to
/// load from embedded assets, a filesystem directory, or a network resource; the core
/// only depends on this trait.
pub trait SchemaProvider {
    fn definitions_for(&self, version: &str) -> Result<Definitions, ReplayError>;
}

#[derive(RustEmbed)]
#[folder = "assets/"]
struct SchemaAssets;

/// Demo `SchemaProvider` backed by assets embedded at compile time under `assets/<version>/`.
/// Each version directory carries a `constants.json` and an `entities.xml`.
#[derive(Default)]
pub struct JsonSchemaProvider;

impl SchemaProvider for JsonSchemaProvider {
    fn definitions_for(&self, version: &str) -> Result<Definitions, ReplayError> {
        let constants_path = format!("{}/constants.json", version);
        let entities_path = format!("{}/entities.xml", version);

        let constants_bytes = SchemaAssets::get(&constants_path)
            .ok_or_else(|| ReplayError::UnsupportedVersion(version.to_string()))?;
        let tables: HashMap<String, JsonValue> = serde_json::from_slice(&constants_bytes.data)?;

        let entities_bytes = SchemaAssets::get(&entities_path)
            .ok_or_else(|| ReplayError::UnsupportedVersion(version.to_string()))?;
        let entities_xml = std::str::from_utf8(&entities_bytes.data)
            .map_err(|e| ReplayError::SchemaError(e.to_string()))?;

        let (by_name, by_index) = parse_entities_xml(entities_xml)?;

        Ok(Definitions {
            constants: Constants { tables },
            by_name,
            by_index,
        })
    }
}

fn parse_field_kind(raw: &str, fixed: Option<&str>) -> Result<FieldKind, ReplayError> {
    match raw {
        "u8" => Ok(FieldKind::U8),
        "u16" => Ok(FieldKind::U16),
        "u32" => Ok(FieldKind::U32),
        "u64" => Ok(FieldKind::U64),
        "i32" => Ok(FieldKind::I32),
        "f32" => Ok(FieldKind::F32),
        "string" => Ok(FieldKind::String),
        "blob" => Ok(FieldKind::Blob),
        "pickle" => Ok(FieldKind::Pickle),
        "fixed" => {
            let len: u32 = fixed
                .ok_or_else(|| ReplayError::SchemaError("fixed field missing len attribute".into()))?
                .parse()
                .map_err(|_| ReplayError::SchemaError("fixed field len is not a number".into()))?;
            Ok(FieldKind::Fixed(len))
        }
        other => Err(ReplayError::SchemaError(format!(
            "unknown field kind {}",
            other
        ))),
    }
}

fn parse_field_list(
    parent: roxmltree::Node,
    list_name: &str,
) -> Result<Vec<FieldCodec>, ReplayError> {
    let mut out = Vec::new();
    let Some(list) = parent.children().find(|n| n.has_tag_name(list_name)) else {
        return Ok(out);
    };
    for field in list.children().filter(|n| n.has_tag_name("field")) {
        let name = field
            .attribute("name")
            .ok_or_else(|| ReplayError::SchemaError("field missing name attribute".into()))?
            .to_string();
        let kind_raw = field
            .attribute("type")
            .ok_or_else(|| ReplayError::SchemaError("field missing type attribute".into()))?;
        let kind = parse_field_kind(kind_raw, field.attribute("len"))?;
        out.push(FieldCodec { name, kind });
    }
    Ok(out)
}

fn parse_method_list(parent: roxmltree::Node) -> Result<Vec<MethodDef>, ReplayError> {
    let mut out = Vec::new();
    let Some(list) = parent.children().find(|n| n.has_tag_name("methods")) else {
        return Ok(out);
    };
    for method in list.children().filter(|n| n.has_tag_name("method")) {
        let name = method
            .attribute("name")
            .ok_or_else(|| ReplayError::SchemaError("method missing name attribute".into()))?
            .to_string();
        let mut args = Vec::new();
        for arg in method.children().filter(|n| n.has_tag_name("arg")) {
            let arg_name = arg.attribute("name").unwrap_or("").to_string();
            let kind_raw = arg
                .attribute("type")
                .ok_or_else(|| ReplayError::SchemaError("arg missing type attribute".into()))?;
            let kind = parse_field_kind(kind_raw, arg.attribute("len"))?;
            args.push(FieldCodec { name: arg_name, kind });
        }
        out.push(MethodDef { name, args });
    }
    Ok(out)
}

fn parse_entities_xml(
    xml: &str,
) -> Result<(HashMap<String, EntityDef>, HashMap<u32, String>), ReplayError> {
    let doc = roxmltree::Document::parse(xml).map_err(|e| ReplayError::SchemaError(e.to_string()))?;
    let root = doc.root_element();

    let mut by_name = HashMap::new();
    let mut by_index = HashMap::new();

    for entity_node in root.children().filter(|n| n.has_tag_name("entity")) {
        let name = entity_node
            .attribute("name")
            .ok_or_else(|| ReplayError::SchemaError("entity missing name attribute".into()))?
            .to_string();
        let index: u32 = entity_node
            .attribute("index")
            .unwrap_or("0")
            .parse()
            .map_err(|_| ReplayError::SchemaError("entity index is not a number".into()))?;

        let def = EntityDef {
            name: name.clone(),
            index,
            base_properties: parse_field_list(entity_node, "base")?,
            client_properties: parse_field_list(entity_node, "client")?,
            client_properties_internal: parse_field_list(entity_node, "client_internal")?,
            cell_properties: parse_field_list(entity_node, "cell")?,
            methods: parse_method_list(entity_node)?,
        };

        by_index.insert(index, name.clone());
        by_name.insert(name, def);
    }

    Ok((by_name, by_index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_entity_xml() {
        let xml = r#"<schema>
            <entity name="Avatar" index="1">
                <base>
                    <field name="accountDBID" type="i32"/>
                </base>
                <client>
                    <field name="privateVehicleState" type="pickle"/>
                </client>
                <methods>
                    <method name="onArenaStateReceived">
                        <arg name="arenaUniqueId" type="u64"/>
                        <arg name="preBattlesInfo" type="pickle"/>
                    </method>
                </methods>
            </entity>
        </schema>"#;
        let (by_name, by_index) = parse_entities_xml(xml).unwrap();
        let avatar = by_name.get("Avatar").unwrap();
        assert_eq!(avatar.base_properties.len(), 1);
        assert_eq!(avatar.client_properties.len(), 1);
        assert_eq!(avatar.methods.len(), 1);
        assert_eq!(avatar.methods[0].name, "onArenaStateReceived");
        assert_eq!(avatar.methods[0].args.len(), 2);
        assert_eq!(by_index.get(&1), Some(&"Avatar".to_string()));
    }

    #[test]
    fn rejects_unknown_field_kind() {
        let xml = r#"<schema>
            <entity name="Bad" index="0">
                <base><field name="x" type="nonsense"/></base>
            </entity>
        </schema>"#;
        let err = parse_entities_xml(xml).unwrap_err();
        assert!(matches!(err, ReplayError::SchemaError(_)));
    }
}

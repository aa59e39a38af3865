use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Value type a template cell is expected to hold.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ValueType {
    Number,
    Date,
    #[default]
    Text,
}

/// One labeled, addressable data cell of a template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CellDescriptor {
    /// Worksheet name as listed in the workbook.
    pub sheet: String,
    pub row_label: String,
    pub column_label: String,
    /// Unique key of the cell within the schema (`B2`, or `Sheet!B2` off the first sheet).
    pub cell_address: String,
    /// 1-based row index.
    pub row: u32,
    /// 1-based column index.
    pub column: u32,
    pub expected_value_type: ValueType,
}

/// Ordered set of data cells derived from a template.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TemplateSchema {
    pub cells: Vec<CellDescriptor>,
}

impl TemplateSchema {
    pub fn new(cells: Vec<CellDescriptor>) -> Self {
        Self { cells }
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CellDescriptor> {
        self.cells.iter()
    }

    pub fn get(&self, cell_address: &str) -> Option<&CellDescriptor> {
        self.cells.iter().find(|c| c.cell_address == cell_address)
    }
}

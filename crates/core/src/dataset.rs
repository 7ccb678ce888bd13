//! Integer-coded tabular datasets.
//!
//! Records are stored as one row per record with one column per domain
//! attribute, each cell an index into that attribute's category range.
//! Large-cardinality attributes are assumed to have been compressed by an
//! upstream preprocessing step.

use std::path::Path;

use ndarray::{Array2, ArrayD, IxDyn};

use crate::clique::Clique;
use crate::domain::Domain;
use crate::error::{Error, Result};
use crate::factor::Factor;

/// A dataset of integer-coded records over a domain.
#[derive(Clone, Debug)]
pub struct Dataset {
    domain: Domain,
    records: Array2<usize>,
}

impl Dataset {
    /// Wrap a record table; every cell must be within its attribute's
    /// cardinality.
    pub fn new(domain: Domain, records: Array2<usize>) -> Result<Self> {
        if records.ncols() != domain.len() {
            return Err(Error::invalid(format!(
                "records have {} columns but the domain has {} attributes",
                records.ncols(),
                domain.len()
            )));
        }
        for row in records.rows() {
            for (j, &v) in row.iter().enumerate() {
                if v >= domain.shape()[j] {
                    return Err(Error::invalid(format!(
                        "value {v} out of range for attribute `{}` (cardinality {})",
                        domain.attrs()[j],
                        domain.shape()[j]
                    )));
                }
            }
        }
        Ok(Self { domain, records })
    }

    /// Build a dataset from row vectors.
    pub fn from_rows(domain: Domain, rows: Vec<Vec<usize>>) -> Result<Self> {
        let ncols = domain.len();
        let nrows = rows.len();
        let mut flat = Vec::with_capacity(nrows * ncols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != ncols {
                return Err(Error::invalid(format!(
                    "row {i} has {} values, expected {ncols}",
                    row.len()
                )));
            }
            flat.extend_from_slice(row);
        }
        let records = Array2::from_shape_vec((nrows, ncols), flat)
            .map_err(|e| Error::invalid(format!("records: {e}")))?;
        Dataset::new(domain, records)
    }

    /// Load a CSV dataset together with its JSON domain file.
    ///
    /// The CSV header must contain every domain attribute; extra columns
    /// are rejected.
    pub fn load(data_path: impl AsRef<Path>, domain_path: impl AsRef<Path>) -> Result<Self> {
        let domain = Domain::load(domain_path)?;
        let text = std::fs::read_to_string(data_path)?;
        Dataset::from_csv(&text, domain)
    }

    /// Parse CSV text against an existing domain.
    pub fn from_csv(text: &str, domain: Domain) -> Result<Self> {
        let mut lines = text.lines().filter(|l| !l.trim().is_empty());
        let header = lines
            .next()
            .ok_or_else(|| Error::parse("empty csv input"))?;
        let columns: Vec<&str> = header.split(',').map(str::trim).collect();
        for col in &columns {
            if !domain.contains(col) {
                return Err(Error::parse(format!(
                    "csv column `{col}` is not a domain attribute"
                )));
            }
        }
        let mut col_of = Vec::with_capacity(domain.len());
        for attr in domain.attrs() {
            let idx = columns
                .iter()
                .position(|c| *c == attr.as_str())
                .ok_or_else(|| Error::parse(format!("csv is missing attribute `{attr}`")))?;
            col_of.push(idx);
        }

        let mut rows = Vec::new();
        for (lineno, line) in lines.enumerate() {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() != columns.len() {
                return Err(Error::parse(format!(
                    "line {}: expected {} fields, found {}",
                    lineno + 2,
                    columns.len(),
                    fields.len()
                )));
            }
            let mut row = Vec::with_capacity(domain.len());
            for &c in &col_of {
                let v: usize = fields[c].parse().map_err(|_| {
                    Error::parse(format!("line {}: `{}` is not an index", lineno + 2, fields[c]))
                })?;
                row.push(v);
            }
            rows.push(row);
        }
        Dataset::from_rows(domain, rows)
    }

    /// Serialize to CSV with a domain-ordered header.
    pub fn to_csv(&self) -> String {
        let mut out = self.domain.attrs().join(",");
        out.push('\n');
        for row in self.records.rows() {
            let fields: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            out.push_str(&fields.join(","));
            out.push('\n');
        }
        out
    }

    /// Write the dataset as CSV.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_csv())?;
        Ok(())
    }

    /// The dataset's domain.
    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    /// The raw record table.
    pub fn records(&self) -> &Array2<usize> {
        &self.records
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.nrows()
    }

    /// True when there are no records.
    pub fn is_empty(&self) -> bool {
        self.records.nrows() == 0
    }

    /// Empirical joint counts over a clique.
    pub fn project(&self, clique: &Clique) -> Result<Factor> {
        let sub = self.domain.project(clique)?;
        let mut pos = Vec::with_capacity(clique.len());
        for attr in clique.iter() {
            // project() above guarantees the attribute exists.
            match self.domain.index_of(attr) {
                Some(i) => pos.push(i),
                None => {
                    return Err(Error::UnknownAttribute {
                        attr: attr.to_string(),
                    })
                }
            }
        }
        let mut values = ArrayD::zeros(IxDyn(sub.shape()));
        let mut idx = vec![0usize; pos.len()];
        for row in self.records.rows() {
            for (j, &p) in pos.iter().enumerate() {
                idx[j] = row[p];
            }
            values[&idx[..]] += 1.0;
        }
        Factor::from_values(sub, values)
    }
}

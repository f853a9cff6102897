use crate::errors::MorphError;
use fnv::FnvHashMap as HashMap;
use log::warn;

/// One metadata column. Missing text is the empty string; missing
/// numbers are `NaN`.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaColumn {
    Text(Vec<Box<str>>),
    Numeric(Vec<f64>),
}

impl MetaColumn {
    /// Type raw cells: numeric if every non-empty cell parses as a
    /// number (and there is at least one), text otherwise
    pub fn from_cells(cells: Vec<Box<str>>) -> Self {
        let mut any_value = false;
        let mut parsed = Vec::with_capacity(cells.len());
        for c in cells.iter() {
            let c = c.trim();
            if c.is_empty() {
                parsed.push(f64::NAN);
                continue;
            }
            match c.parse::<f64>() {
                Ok(v) => {
                    any_value = true;
                    parsed.push(v);
                }
                Err(_) => return MetaColumn::Text(cells),
            }
        }
        if any_value {
            MetaColumn::Numeric(parsed)
        } else {
            MetaColumn::Text(cells)
        }
    }

    /// A column of `n` missing values
    pub fn missing(n: usize, numeric: bool) -> Self {
        if numeric {
            MetaColumn::Numeric(vec![f64::NAN; n])
        } else {
            MetaColumn::Text(vec![Box::from(""); n])
        }
    }

    pub fn len(&self) -> usize {
        match self {
            MetaColumn::Text(v) => v.len(),
            MetaColumn::Numeric(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, MetaColumn::Numeric(_))
    }

    /// Value at `i` as text; missing numbers become the empty string
    pub fn text_at(&self, i: usize) -> Box<str> {
        match self {
            MetaColumn::Text(v) => v[i].clone(),
            MetaColumn::Numeric(v) if v[i].is_nan() => Box::from(""),
            MetaColumn::Numeric(v) => v[i].to_string().into_boxed_str(),
        }
    }

    pub fn to_text(&self) -> Vec<Box<str>> {
        (0..self.len()).map(|i| self.text_at(i)).collect()
    }

    pub fn select(&self, indices: &[usize]) -> Self {
        match self {
            MetaColumn::Text(v) => MetaColumn::Text(indices.iter().map(|&i| v[i].clone()).collect()),
            MetaColumn::Numeric(v) => MetaColumn::Numeric(indices.iter().map(|&i| v[i]).collect()),
        }
    }

    /// Select rows, leaving `None` positions missing
    pub fn select_or_missing(&self, indices: &[Option<usize>]) -> Self {
        match self {
            MetaColumn::Text(v) => MetaColumn::Text(
                indices
                    .iter()
                    .map(|i| i.map(|i| v[i].clone()).unwrap_or_else(|| Box::from("")))
                    .collect(),
            ),
            MetaColumn::Numeric(v) => MetaColumn::Numeric(
                indices
                    .iter()
                    .map(|i| i.map(|i| v[i]).unwrap_or(f64::NAN))
                    .collect(),
            ),
        }
    }

    /// Append `other` below; mixed kinds fall back to text
    fn append(&mut self, other: &MetaColumn) {
        match (&mut *self, other) {
            (MetaColumn::Text(a), MetaColumn::Text(b)) => a.extend(b.iter().cloned()),
            (MetaColumn::Numeric(a), MetaColumn::Numeric(b)) => a.extend_from_slice(b),
            (MetaColumn::Text(a), b) => a.extend(b.to_text()),
            (a, b) => {
                let mut text = a.to_text();
                text.extend(b.to_text());
                *a = MetaColumn::Text(text);
            }
        }
    }
}

/// Ordered, named observation metadata columns of equal length
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaTable {
    nrows: usize,
    names: Vec<Box<str>>,
    columns: Vec<MetaColumn>,
}

impl MetaTable {
    /// A table with `nrows` rows and no columns
    pub fn empty(nrows: usize) -> Self {
        Self {
            nrows,
            names: vec![],
            columns: vec![],
        }
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.names.len()
    }

    pub fn column_names(&self) -> &[Box<str>] {
        &self.names
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|x| x.as_ref() == name)
    }

    pub fn column(&self, name: &str) -> Option<&MetaColumn> {
        self.position(name).map(|j| &self.columns[j])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Box<str>, &MetaColumn)> {
        self.names.iter().zip(self.columns.iter())
    }

    /// Add a column or replace the one with the same name
    pub fn insert(&mut self, name: &str, column: MetaColumn) -> anyhow::Result<()> {
        if column.len() != self.nrows {
            return Err(MorphError::shape_mismatch(
                format!("metadata column `{}`", name),
                self.nrows,
                column.len(),
            )
            .into());
        }
        match self.position(name) {
            Some(j) => self.columns[j] = column,
            None => {
                self.names.push(Box::from(name));
                self.columns.push(column);
            }
        }
        Ok(())
    }

    pub fn rename(&mut self, from: &str, to: &str) -> anyhow::Result<()> {
        let j = self
            .position(from)
            .ok_or(anyhow::anyhow!("no metadata column `{}`", from))?;
        if let Some(k) = self.position(to) {
            if k != j {
                self.names.remove(k);
                self.columns.remove(k);
            }
        }
        let j = self.position(from).unwrap_or(j);
        self.names[j] = Box::from(to);
        Ok(())
    }

    pub fn select_rows(&self, indices: &[usize]) -> Self {
        Self {
            nrows: indices.len(),
            names: self.names.clone(),
            columns: self.columns.iter().map(|c| c.select(indices)).collect(),
        }
    }

    /// Stack tables vertically. Columns are the union in order of
    /// first appearance; rows of tables lacking a column get missing
    /// values so row counts stay aligned.
    pub fn concat(tables: &[MetaTable]) -> Self {
        let mut names: Vec<Box<str>> = vec![];
        let mut numeric: Vec<bool> = vec![];
        for t in tables {
            for (name, col) in t.iter() {
                match names.iter().position(|x| x == name) {
                    Some(j) => numeric[j] &= col.is_numeric(),
                    None => {
                        names.push(name.clone());
                        numeric.push(col.is_numeric());
                    }
                }
            }
        }

        let mut ret = Self {
            nrows: 0,
            names: names.clone(),
            columns: numeric.iter().map(|&n| MetaColumn::missing(0, n)).collect(),
        };

        for t in tables {
            for (j, name) in names.iter().enumerate() {
                match t.column(name) {
                    Some(col) => ret.columns[j].append(col),
                    None => ret.columns[j].append(&MetaColumn::missing(t.nrows, numeric[j])),
                }
            }
            ret.nrows += t.nrows;
        }
        ret
    }

    /// Key of row `i` over the columns at `positions`
    pub fn row_key(&self, positions: &[usize], i: usize) -> Vec<Box<str>> {
        positions.iter().map(|&j| self.columns[j].text_at(i)).collect()
    }

    /// Left join `right` on all shared column names, adding the
    /// remaining columns of `right`. Row order and count of `self`
    /// are kept. Returns the number of rows that found a match.
    pub fn left_join(&mut self, right: &MetaTable) -> anyhow::Result<usize> {
        let shared: Vec<Box<str>> = self
            .names
            .iter()
            .filter(|x| right.position(x).is_some())
            .cloned()
            .collect();

        if shared.is_empty() {
            warn!("no shared metadata columns to join on");
            return Ok(0);
        }

        let left_pos: Vec<usize> = shared.iter().filter_map(|x| self.position(x)).collect();
        let right_pos: Vec<usize> = shared.iter().filter_map(|x| right.position(x)).collect();

        let mut lookup: HashMap<Vec<Box<str>>, usize> = HashMap::default();
        let mut ndup = 0;
        for i in 0..right.nrows {
            if lookup.insert(right.row_key(&right_pos, i), i).is_some() {
                ndup += 1;
            }
        }
        if ndup > 0 {
            warn!("{} duplicated join keys; the last occurrence wins", ndup);
        }

        let matched: Vec<Option<usize>> = (0..self.nrows)
            .map(|i| lookup.get(&self.row_key(&left_pos, i)).copied())
            .collect();

        for (name, col) in right.iter() {
            if shared.contains(name) {
                continue;
            }
            self.insert(name, col.select_or_missing(&matched))?;
        }

        Ok(matched.iter().filter(|x| x.is_some()).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(xs: &[&str]) -> MetaColumn {
        MetaColumn::Text(xs.iter().map(|&x| Box::from(x)).collect())
    }

    #[test]
    fn cells_are_typed() {
        let c = MetaColumn::from_cells(vec!["1".into(), "".into(), "2.5".into()]);
        assert!(c.is_numeric());
        assert_eq!(c.text_at(1).as_ref(), "");
        assert_eq!(c.text_at(0).as_ref(), "1");

        let c = MetaColumn::from_cells(vec!["A01".into(), "3".into()]);
        assert!(!c.is_numeric());
    }

    #[test]
    fn concat_fills_missing_columns() -> anyhow::Result<()> {
        let mut a = MetaTable::empty(2);
        a.insert("Well", text(&["A01", "A02"]))?;
        let mut b = MetaTable::empty(1);
        b.insert("Well", text(&["B01"]))?;
        b.insert("Site", MetaColumn::Numeric(vec![3.0]))?;

        let ab = MetaTable::concat(&[a, b]);
        assert_eq!(ab.nrows(), 3);
        assert_eq!(ab.column("Well").map(|c| c.text_at(2)), Some("B01".into()));
        assert_eq!(ab.column("Site").map(|c| c.text_at(0)), Some("".into()));
        assert_eq!(ab.column("Site").map(|c| c.text_at(2)), Some("3".into()));
        Ok(())
    }

    #[test]
    fn left_join_keeps_rows() -> anyhow::Result<()> {
        let mut cells = MetaTable::empty(3);
        cells.insert("Well", text(&["A01", "A02", "A01"]))?;
        let mut image = MetaTable::empty(1);
        image.insert("Well", text(&["A01"]))?;
        image.insert("Count", MetaColumn::Numeric(vec![10.0]))?;

        let nmatched = cells.left_join(&image)?;
        assert_eq!(nmatched, 2);
        assert_eq!(cells.nrows(), 3);
        let count = cells.column("Count").map(|c| c.to_text());
        assert_eq!(count, Some(vec!["10".into(), "".into(), "10".into()]));
        Ok(())
    }
}

use std::collections::BTreeMap;

use rayon::prelude::*;

use crate::{GraphErr, Result};

/// A sparse matrix in compressed sparse row format holding path counts.
///
/// Columns are sorted and unique inside every row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrMatrix {
    nrows: usize,
    ncols: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    data: Vec<u64>,
}

impl CsrMatrix {
    /// Creates a new `CsrMatrix` from a list of `(row, col)` entries.
    ///
    /// # Arguments
    /// * `nrows` - The amount of rows of the matrix.
    /// * `ncols` - The amount of columns of the matrix.
    /// * `entries` - The non zero entries, each one counts as a 1, repeated entries are summed up.
    ///
    /// # Returns
    /// A new `CsrMatrix` or an error if an entry falls outside the matrix.
    pub fn from_entries<I>(nrows: usize, ncols: usize, entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (usize, usize)>,
    {
        let mut rows = vec![BTreeMap::new(); nrows];

        for (r, c) in entries {
            if r >= nrows {
                return Err(GraphErr::NodeOutOfBounds {
                    what: "row",
                    id: r,
                    len: nrows,
                });
            }

            if c >= ncols {
                return Err(GraphErr::NodeOutOfBounds {
                    what: "column",
                    id: c,
                    len: ncols,
                });
            }

            let count: &mut u64 = rows[r].entry(c).or_default();
            *count = count.saturating_add(1);
        }

        Ok(Self::from_rows(nrows, ncols, rows))
    }

    fn from_rows(nrows: usize, ncols: usize, rows: Vec<BTreeMap<usize, u64>>) -> Self {
        let nnz = rows.iter().map(BTreeMap::len).sum();
        let mut indptr = Vec::with_capacity(nrows + 1);
        let mut indices = Vec::with_capacity(nnz);
        let mut data = Vec::with_capacity(nnz);

        indptr.push(0);
        for row in rows {
            for (c, v) in row {
                indices.push(c);
                data.push(v);
            }
            indptr.push(indices.len());
        }

        Self {
            nrows,
            ncols,
            indptr,
            indices,
            data,
        }
    }

    /// Returns the `(rows, cols)` shape of the matrix.
    pub fn shape(&self) -> (usize, usize) {
        (self.nrows, self.ncols)
    }

    /// Returns the amount of stored entries.
    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    /// Returns the columns and values stored in row `r`.
    ///
    /// # Panics
    /// If `r` is not a row of the matrix.
    pub fn row(&self, r: usize) -> (&[usize], &[u64]) {
        let (start, end) = (self.indptr[r], self.indptr[r + 1]);
        (&self.indices[start..end], &self.data[start..end])
    }

    /// Iterates the stored entries as `(row, col, value)` in row major order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, u64)> + '_ {
        (0..self.nrows).flat_map(move |r| {
            let (cols, vals) = self.row(r);
            cols.iter().zip(vals).map(move |(&c, &v)| (r, c, v))
        })
    }

    /// Multiplies this matrix by `rhs`.
    ///
    /// Rows of the product are computed in parallel, every entry counts the paths going
    /// through the shared dimension.
    ///
    /// # Arguments
    /// * `rhs` - The right hand side matrix, it must have as many rows as this one has columns.
    ///
    /// # Returns
    /// The product or an error if the dimensions don't match.
    pub fn matmul(&self, rhs: &CsrMatrix) -> Result<CsrMatrix> {
        if self.ncols != rhs.nrows {
            return Err(GraphErr::SizeMismatch {
                what: "matrix product",
                got: rhs.nrows,
                expected: self.ncols,
            });
        }

        let rows: Vec<BTreeMap<usize, u64>> = (0..self.nrows)
            .into_par_iter()
            .map(|r| {
                let mut acc = BTreeMap::new();
                let (cols, vals) = self.row(r);

                for (&k, &a) in cols.iter().zip(vals) {
                    let (rcols, rvals) = rhs.row(k);

                    for (&c, &b) in rcols.iter().zip(rvals) {
                        let entry: &mut u64 = acc.entry(c).or_default();
                        *entry = entry.saturating_add(a.saturating_mul(b));
                    }
                }

                acc
            })
            .collect();

        Ok(Self::from_rows(self.nrows, rhs.ncols, rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_entries_are_summed() {
        let m = CsrMatrix::from_entries(2, 3, [(0, 2), (0, 2), (1, 0), (0, 1)]).unwrap();

        assert_eq!(m.shape(), (2, 3));
        assert_eq!(m.nnz(), 3);
        assert_eq!(m.row(0), (&[1, 2][..], &[1, 2][..]));
        assert_eq!(m.row(1), (&[0][..], &[1][..]));
    }

    #[test]
    fn out_of_bounds_entry() {
        let err = CsrMatrix::from_entries(2, 2, [(0, 2)]).unwrap_err();
        assert_eq!(
            err,
            GraphErr::NodeOutOfBounds {
                what: "column",
                id: 2,
                len: 2
            }
        );
    }

    #[test]
    fn matmul_counts_paths() {
        // paper -> author
        let pa = CsrMatrix::from_entries(3, 2, [(0, 0), (1, 0), (1, 1), (2, 1)]).unwrap();
        // author -> paper
        let ap = CsrMatrix::from_entries(2, 3, [(0, 0), (0, 1), (1, 1), (1, 2)]).unwrap();

        let pap = pa.matmul(&ap).unwrap();
        let entries: Vec<_> = pap.iter().collect();

        assert_eq!(
            entries,
            vec![
                (0, 0, 1),
                (0, 1, 1),
                (1, 0, 1),
                (1, 1, 2),
                (1, 2, 1),
                (2, 1, 1),
                (2, 2, 1),
            ]
        );
    }

    #[test]
    fn matmul_dimension_mismatch() {
        let a = CsrMatrix::from_entries(2, 3, []).unwrap();
        let b = CsrMatrix::from_entries(2, 3, []).unwrap();

        assert!(matches!(
            a.matmul(&b),
            Err(GraphErr::SizeMismatch { got: 2, expected: 3, .. })
        ));
    }
}

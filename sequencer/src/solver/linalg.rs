//! Small dense linear algebra for the reference solvers.
//!
//! Matrices are row-major `Vec<Vec<f64>>`. Problem sizes are the number of
//! registered variables and constraints, so nothing here needs to be clever.

pub type Matrix = Vec<Vec<f64>>;

const PIVOT_EPS: f64 = 1e-12;

pub fn identity(n: usize) -> Matrix {
    (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect()
}

pub fn transpose(a: &Matrix) -> Matrix {
    let rows = a.len();
    let cols = a.first().map_or(0, Vec::len);
    (0..cols)
        .map(|j| (0..rows).map(|i| a[i][j]).collect())
        .collect()
}

pub fn mat_mul(a: &Matrix, b: &Matrix) -> Matrix {
    let inner = b.len();
    let cols = b.first().map_or(0, Vec::len);
    a.iter()
        .map(|row| {
            (0..cols)
                .map(|j| (0..inner).map(|k| row[k] * b[k][j]).sum())
                .collect()
        })
        .collect()
}

pub fn mat_vec(a: &Matrix, x: &[f64]) -> Vec<f64> {
    a.iter().map(|row| dot(row, x)).collect()
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn norm_inf(x: &[f64]) -> f64 {
    x.iter().fold(0.0, |acc, v| acc.max(v.abs()))
}

/// Solve `a x = b` by Gaussian elimination with partial pivoting.
///
/// Returns `None` when the system is singular to working precision.
pub fn solve(a: &Matrix, b: &[f64]) -> Option<Vec<f64>> {
    let n = b.len();
    if a.len() != n || a.iter().any(|row| row.len() != n) {
        return None;
    }
    let scale = a
        .iter()
        .flat_map(|row| row.iter())
        .fold(0.0_f64, |acc, v| acc.max(v.abs()))
        .max(1.0);
    let mut m: Matrix = a
        .iter()
        .zip(b)
        .map(|(row, rhs)| {
            let mut row = row.clone();
            row.push(*rhs);
            row
        })
        .collect();

    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))?;
        if m[pivot][col].abs() <= PIVOT_EPS * scale {
            return None;
        }
        m.swap(col, pivot);
        for row in (col + 1)..n {
            let factor = m[row][col] / m[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..=n {
                m[row][k] -= factor * m[col][k];
            }
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = ((row + 1)..n).map(|k| m[row][k] * x[k]).sum();
        x[row] = (m[row][n] - tail) / m[row][row];
    }
    Some(x)
}

/// Solve `j dx = rhs` for a possibly non-square Jacobian.
///
/// Square systems are solved directly, overdetermined ones in the least
/// squares sense, underdetermined ones with the minimum-norm step.
pub fn solve_jacobian(j: &Matrix, rhs: &[f64]) -> Option<Vec<f64>> {
    let rows = j.len();
    let cols = j.first().map_or(0, Vec::len);
    if rows == cols {
        return solve(j, rhs);
    }
    let jt = transpose(j);
    if rows > cols {
        let normal = mat_mul(&jt, j);
        solve(&normal, &mat_vec(&jt, rhs))
    } else {
        let gram = mat_mul(j, &jt);
        let y = solve(&gram, rhs)?;
        Some(mat_vec(&jt, &y))
    }
}

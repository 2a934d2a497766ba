use super::geometry::RowLayout;
use super::gf;

/// Per-position plaintext of one chunk row; `None` marks an unavailable
/// position.
pub type Columns = Vec<Option<Vec<u8>>>;

fn column_len(cols: &Columns) -> usize {
    cols.iter().flatten().map(|c| c.len()).next().unwrap_or(0)
}

fn xor_into(dst: &mut [u8], src: &[u8]) {
    dst.iter_mut().zip(src).for_each(|(d, s)| *d ^= *s);
}

fn p_syndrome(cols: &Columns, data: &[usize], skip: &[usize], len: usize) -> Vec<u8> {
    let mut acc = vec![0u8; len];
    for pos in data.iter().filter(|p| !skip.contains(p)) {
        if let Some(col) = &cols[*pos] {
            xor_into(&mut acc, col);
        }
    }
    acc
}

fn q_syndrome(cols: &Columns, data: &[usize], skip: &[usize], len: usize) -> Vec<u8> {
    let mut acc = vec![0u8; len];
    for (index, pos) in data.iter().enumerate() {
        if skip.contains(pos) {
            continue;
        }
        if let Some(col) = &cols[*pos] {
            gf::mul_xor_into(&mut acc, col, gf::pow2(index as i32));
        }
    }
    acc
}

/// Recomputes every redundant position (parity or mirror copies) from the
/// data positions, which must all be present.
pub fn fill_redundancy(layout: &RowLayout, cols: &mut Columns) {
    let len = column_len(cols);
    match layout {
        RowLayout::Striped { .. } => {}
        RowLayout::Mirrored { copies } => {
            if let Some(source) = cols[copies[0]].clone() {
                for pos in copies.iter().skip(1) {
                    cols[*pos] = Some(source.clone());
                }
            }
        }
        RowLayout::StripedMirror { pairs } => {
            for [primary, secondary] in pairs.iter() {
                cols[*secondary] = cols[*primary].clone();
            }
        }
        RowLayout::Parity { data, p } => {
            cols[*p] = Some(p_syndrome(cols, data, &[], len));
        }
        RowLayout::DualParity { data, p, q } => {
            cols[*p] = Some(p_syndrome(cols, data, &[], len));
            cols[*q] = Some(q_syndrome(cols, data, &[], len));
        }
    }
}

/// Fills the `missing` positions from the surviving ones. Returns `false`
/// when the layout cannot recover that combination.
pub fn reconstruct(layout: &RowLayout, cols: &mut Columns, missing: &[usize]) -> bool {
    if missing.is_empty() {
        return true;
    }
    if !layout.can_reconstruct(missing) {
        return false;
    }
    let len = column_len(cols);
    for pos in missing {
        cols[*pos] = None;
    }
    match layout {
        RowLayout::Striped { .. } => false,
        RowLayout::Mirrored { copies } => {
            let Some(source) = copies.iter().find_map(|p| cols[*p].clone()) else {
                return false;
            };
            for pos in missing {
                cols[*pos] = Some(source.clone());
            }
            true
        }
        RowLayout::StripedMirror { pairs } => {
            for [a, b] in pairs.iter() {
                if cols[*a].is_none() {
                    cols[*a] = cols[*b].clone();
                } else if cols[*b].is_none() {
                    cols[*b] = cols[*a].clone();
                }
            }
            true
        }
        RowLayout::Parity { data, p } => {
            let pos = missing[0];
            if pos == *p {
                cols[*p] = Some(p_syndrome(cols, data, &[], len));
            } else {
                let mut value = p_syndrome(cols, data, &[pos], len);
                if let Some(parity) = &cols[*p] {
                    xor_into(&mut value, parity);
                }
                cols[pos] = Some(value);
            }
            true
        }
        RowLayout::DualParity { data, p, q } => reconstruct_dual(cols, data, *p, *q, missing, len),
    }
}

fn reconstruct_dual(
    cols: &mut Columns,
    data: &[usize],
    p: usize,
    q: usize,
    missing: &[usize],
    len: usize,
) -> bool {
    let lost_data: Vec<usize> = data
        .iter()
        .enumerate()
        .filter(|(_, pos)| missing.contains(pos))
        .map(|(index, _)| index)
        .collect();
    let p_lost = missing.contains(&p);
    let q_lost = missing.contains(&q);

    match lost_data.as_slice() {
        [] => {}
        [x] if !p_lost => {
            let mut value = p_syndrome(cols, data, &[data[*x]], len);
            if let Some(parity) = &cols[p] {
                xor_into(&mut value, parity);
            }
            cols[data[*x]] = Some(value);
        }
        [x] => {
            let Some(q_col) = cols[q].clone() else {
                return false;
            };
            let mut value = q_syndrome(cols, data, &[data[*x]], len);
            xor_into(&mut value, &q_col);
            gf::scale(&mut value, gf::div(1, gf::pow2(*x as i32)));
            cols[data[*x]] = Some(value);
        }
        [x, y] => {
            let (Some(p_col), Some(q_col)) = (cols[p].clone(), cols[q].clone()) else {
                return false;
            };
            let skip = [data[*x], data[*y]];
            let mut pxy = p_syndrome(cols, data, &skip, len);
            xor_into(&mut pxy, &p_col);
            let mut qxy = q_syndrome(cols, data, &skip, len);
            xor_into(&mut qxy, &q_col);

            let gyx = gf::pow2(*y as i32 - *x as i32);
            let denom = gyx ^ 1;
            let a = gf::div(gyx, denom);
            let b = gf::div(gf::pow2(-(*x as i32)), denom);

            let mut dx = vec![0u8; len];
            gf::mul_xor_into(&mut dx, &pxy, a);
            gf::mul_xor_into(&mut dx, &qxy, b);
            let mut dy = pxy;
            xor_into(&mut dy, &dx);
            cols[data[*x]] = Some(dx);
            cols[data[*y]] = Some(dy);
        }
        _ => return false,
    }

    if p_lost {
        cols[p] = Some(p_syndrome(cols, data, &[], len));
    }
    if q_lost {
        cols[q] = Some(q_syndrome(cols, data, &[], len));
    }
    true
}

//! GF(2^8) arithmetic over the 0x11d polynomial, generator 2, as used for
//! RAID-6 Q parity.

const POLY: u16 = 0x11d;

const fn build_tables() -> ([u8; 512], [u8; 256]) {
    let mut exp = [0u8; 512];
    let mut log = [0u8; 256];
    let mut x: u16 = 1;
    let mut i = 0;
    while i < 255 {
        exp[i] = x as u8;
        log[x as usize] = i as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= POLY;
        }
        i += 1;
    }
    while i < 512 {
        exp[i] = exp[i - 255];
        i += 1;
    }
    (exp, log)
}

const TABLES: ([u8; 512], [u8; 256]) = build_tables();
const EXP: [u8; 512] = TABLES.0;
const LOG: [u8; 256] = TABLES.1;

pub fn mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    EXP[LOG[a as usize] as usize + LOG[b as usize] as usize]
}

/// `a / b`; `b` must be non-zero.
pub fn div(a: u8, b: u8) -> u8 {
    debug_assert!(b != 0, "division by zero in GF(2^8)");
    if a == 0 {
        return 0;
    }
    EXP[(LOG[a as usize] as usize + 255 - LOG[b as usize] as usize) % 255]
}

/// `g^power` for any integer power.
pub fn pow2(power: i32) -> u8 {
    EXP[power.rem_euclid(255) as usize]
}

/// `dst ^= coef * src`, bytewise.
pub fn mul_xor_into(dst: &mut [u8], src: &[u8], coef: u8) {
    if coef == 1 {
        dst.iter_mut().zip(src).for_each(|(d, s)| *d ^= *s);
        return;
    }
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= mul(*s, coef);
    }
}

pub fn scale(buf: &mut [u8], coef: u8) {
    for b in buf.iter_mut() {
        *b = mul(*b, coef);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generator_cycle() {
        assert_eq!(pow2(0), 1);
        assert_eq!(pow2(1), 2);
        assert_eq!(pow2(8), 0x1d);
        assert_eq!(pow2(255), 1);
        assert_eq!(pow2(-1), pow2(254));
    }

    #[test]
    fn test_mul_div_inverse() {
        for a in 1..=255u8 {
            for b in [1u8, 2, 3, 0x53, 0xCA, 0xFF] {
                assert_eq!(div(mul(a, b), b), a);
            }
        }
        assert_eq!(mul(0, 7), 0);
        assert_eq!(div(0, 7), 0);
    }

    #[test]
    fn test_mul_xor_into() {
        let mut dst = [1u8, 2, 3];
        mul_xor_into(&mut dst, &[1, 1, 1], 1);
        assert_eq!(dst, [0, 3, 2]);
        let mut dst = [0u8; 2];
        mul_xor_into(&mut dst, &[3, 0], 2);
        assert_eq!(dst, [6, 0]);
    }
}

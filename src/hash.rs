use blstrs::Scalar as Fr;
use generic_array::typenum::{U11, U2, U4, U8};
use lazy_static::lazy_static;
use neptune::poseidon::{Poseidon, PoseidonConstants};

lazy_static! {
    pub static ref POSEIDON_CONSTANTS_2: PoseidonConstants<Fr, U2> = PoseidonConstants::new();
    pub static ref POSEIDON_CONSTANTS_4: PoseidonConstants<Fr, U4> = PoseidonConstants::new();
    pub static ref POSEIDON_CONSTANTS_8: PoseidonConstants<Fr, U8> = PoseidonConstants::new();
    pub static ref POSEIDON_CONSTANTS_11: PoseidonConstants<Fr, U11> = PoseidonConstants::new();
}

/// Hash one column, i.e. the per-layer values of a single node.
pub fn hash_column(column: &[Fr]) -> Fr {
    match column.len() {
        2 => Poseidon::new_with_preimage(column, &*POSEIDON_CONSTANTS_2).hash(),
        11 => Poseidon::new_with_preimage(column, &*POSEIDON_CONSTANTS_11).hash(),
        n => panic!("unsupported column size: {}", n),
    }
}

/// Hash the children of one interior tree node.
pub fn hash_children(children: &[Fr]) -> Fr {
    match children.len() {
        2 => Poseidon::new_with_preimage(children, &*POSEIDON_CONSTANTS_2).hash(),
        4 => Poseidon::new_with_preimage(children, &*POSEIDON_CONSTANTS_4).hash(),
        8 => Poseidon::new_with_preimage(children, &*POSEIDON_CONSTANTS_8).hash(),
        n => panic!("unsupported arity: {}", n),
    }
}

/// Combine a key with a data node into the encoded replica node.
pub fn encode_fr(key: &mut Fr, value: Fr) {
    *key += value;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ff::Field;

    #[test]
    fn test_hash_is_deterministic() {
        let column = vec![Fr::ONE; 11];
        assert_eq!(hash_column(&column), hash_column(&column));

        let children = vec![Fr::ONE; 8];
        assert_eq!(hash_children(&children), hash_children(&children));
        assert_ne!(hash_children(&children), hash_column(&column[..2]));
    }

    #[test]
    fn test_encode_adds() {
        let mut key = Fr::from(3u64);
        encode_fr(&mut key, Fr::from(4u64));
        assert_eq!(key, Fr::from(7u64));
    }

    #[test]
    #[should_panic]
    fn test_unsupported_column() {
        hash_column(&[Fr::ZERO; 3]);
    }
}

use crate::util::sha256d;

fn join(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    sha256d(&buf)
}

/// Merkle branch for position 0 of `[coinbase, hashes..]`. Hashes are in
/// internal byte order.
pub fn merkle_branch(hashes: &[[u8; 32]]) -> Vec<[u8; 32]> {
    let mut steps = Vec::new();
    // Nodes right of the coinbase path at the current level.
    let mut rest = hashes.to_vec();
    while let Some(&first) = rest.first() {
        steps.push(first);
        if rest.len() % 2 == 0 {
            // Odd level width (coinbase path + rest): duplicate the last node.
            let last = rest[rest.len() - 1];
            rest.push(last);
        }
        rest = rest[1..].chunks(2).map(|pair| join(&pair[0], &pair[1])).collect();
    }
    steps
}

/// Rebuilds the merkle root from the coinbase hash and its branch.
pub fn merkle_root_from_branch(coinbase_hash: &[u8; 32], branch: &[[u8; 32]]) -> [u8; 32] {
    branch.iter().fold(*coinbase_hash, |acc, step| join(&acc, step))
}

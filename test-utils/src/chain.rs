//! An in-memory chain service.
use std::{
    collections::{HashMap, HashSet},
    future::{ready, Ready},
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll},
};

use tower::Service;

use ohmc_types::{
    chain::{BehaviorFlags, BestState, ChainError, ChainRequest, ChainResponse},
    Block,
};

/// A block known to the [`MockChain`].
#[derive(Debug, Clone, Copy)]
struct BlockEntry {
    height: u64,
    previous: [u8; 32],
}

#[derive(Debug)]
struct MockChainState {
    blocks: HashMap<[u8; 32], BlockEntry>,
    tip: BestState,
    genesis: [u8; 32],
    processed: Vec<([u8; 32], BehaviorFlags)>,
    processed_headers: Vec<[u8; 32]>,
    invalid_blocks: HashSet<[u8; 32]>,
    invalid_headers: HashSet<[u8; 32]>,
    failing_blocks: HashSet<[u8; 32]>,
    is_current: bool,
}

impl MockChainState {
    fn add_block(&mut self, block: &Block) -> Option<u64> {
        let parent = self.blocks.get(&block.previous())?;
        let height = parent.height + 1;
        let hash = block.hash();

        self.blocks.insert(
            hash,
            BlockEntry {
                height,
                previous: block.previous(),
            },
        );

        if height > self.tip.height {
            self.tip = BestState { hash, height };
        }

        Some(height)
    }

    fn locator_from(&self, hash: [u8; 32]) -> Vec<[u8; 32]> {
        let Some(mut entry) = self.blocks.get(&hash).copied() else {
            return vec![hash];
        };

        let mut locator = vec![hash];
        let mut current = hash;
        let mut step = 1;

        while entry.height != 0 {
            // Walk back `step` blocks.
            for _ in 0..step {
                if entry.height == 0 {
                    break;
                }
                current = entry.previous;
                entry = self.blocks[&current];
            }

            locator.push(current);

            if locator.len() > 10 {
                step *= 2;
            }
        }

        if locator.last() != Some(&self.genesis) {
            locator.push(self.genesis);
        }

        locator
    }
}

/// An in-memory chain service holding a tree of blocks, the longest branch is the main chain.
///
/// Cloning gives another handle to the same chain.
#[derive(Debug, Clone)]
pub struct MockChain(Arc<Mutex<MockChainState>>);

impl MockChain {
    /// Creates a new chain containing only `genesis`.
    pub fn new(genesis: &Block) -> Self {
        let hash = genesis.hash();

        Self(Arc::new(Mutex::new(MockChainState {
            blocks: HashMap::from([(
                hash,
                BlockEntry {
                    height: 0,
                    previous: [0; 32],
                },
            )]),
            tip: BestState { hash, height: 0 },
            genesis: hash,
            processed: vec![],
            processed_headers: vec![],
            invalid_blocks: HashSet::new(),
            invalid_headers: HashSet::new(),
            failing_blocks: HashSet::new(),
            is_current: false,
        })))
    }

    /// Creates a new chain containing `genesis` and `blocks`, without recording them as processed.
    pub fn with_blocks(genesis: &Block, blocks: &[Block]) -> Self {
        let chain = Self::new(genesis);

        {
            let mut state = chain.state();
            for block in blocks {
                state
                    .add_block(block)
                    .expect("blocks must be given parent first");
            }
        }

        chain
    }

    fn state(&self) -> MutexGuard<'_, MockChainState> {
        self.0.lock().unwrap()
    }

    /// Makes the chain reject the block with this hash.
    pub fn mark_invalid_block(&self, hash: [u8; 32]) {
        self.state().invalid_blocks.insert(hash);
    }

    /// Makes the next attempt to process the block with this hash fail with [`ChainError::Internal`].
    pub fn fail_block_once(&self, hash: [u8; 32]) {
        self.state().failing_blocks.insert(hash);
    }

    /// Makes the chain reject any batch of headers containing the header with this hash.
    pub fn mark_invalid_header(&self, hash: [u8; 32]) {
        self.state().invalid_headers.insert(hash);
    }

    /// Sets the value returned for [`ChainRequest::IsCurrent`].
    pub fn set_current(&self, is_current: bool) {
        self.state().is_current = is_current;
    }

    /// Returns the current tip.
    pub fn best(&self) -> BestState {
        self.state().tip
    }

    /// Returns `true` if the block is in the chain.
    pub fn contains(&self, hash: &[u8; 32]) -> bool {
        self.state().blocks.contains_key(hash)
    }

    /// Returns the hashes of every block added through [`ChainRequest::ProcessBlock`], in order.
    pub fn processed_blocks(&self) -> Vec<[u8; 32]> {
        self.state().processed.iter().map(|(hash, _)| *hash).collect()
    }

    /// Returns every block added through [`ChainRequest::ProcessBlock`] with the flags it was
    /// processed with, in order.
    pub fn processed_blocks_with_flags(&self) -> Vec<([u8; 32], BehaviorFlags)> {
        self.state().processed.clone()
    }

    /// Returns the hashes of every header accepted through [`ChainRequest::ProcessHeaders`], in order.
    pub fn processed_headers(&self) -> Vec<[u8; 32]> {
        self.state().processed_headers.clone()
    }

    fn handle(&self, req: ChainRequest) -> Result<ChainResponse, ChainError> {
        let mut state = self.state();

        Ok(match req {
            ChainRequest::ProcessHeaders(headers) => {
                if let Some(header) = headers
                    .iter()
                    .find(|h| state.invalid_headers.contains(&h.hash()))
                {
                    return Err(ChainError::Rule(format!(
                        "invalid header: {:?}",
                        header.hash()
                    )));
                }

                state
                    .processed_headers
                    .extend(headers.iter().map(ohmc_types::BlockHeader::hash));

                ChainResponse::HeadersAccepted(headers.len())
            }
            ChainRequest::ProcessBlock { block, flags } => {
                let hash = block.hash();

                if state.blocks.contains_key(&hash) {
                    return Err(ChainError::Duplicate);
                }

                if state.failing_blocks.remove(&hash) {
                    return Err(ChainError::Internal("database unavailable".into()));
                }

                if state.invalid_blocks.contains(&hash) {
                    return Err(ChainError::Rule("invalid block".to_string()));
                }

                if state.add_block(&block).is_none() {
                    return Ok(ChainResponse::BlockProcessed { is_orphan: true });
                }

                state.processed.push((hash, flags));

                ChainResponse::BlockProcessed { is_orphan: false }
            }
            ChainRequest::BestSnapshot => ChainResponse::BestSnapshot(state.tip),
            ChainRequest::HaveBlock(hash) => {
                ChainResponse::HaveBlock(state.blocks.contains_key(&hash))
            }
            ChainRequest::BlockHeight(hash) => {
                ChainResponse::BlockHeight(state.blocks.get(&hash).map(|entry| entry.height))
            }
            ChainRequest::LatestBlockLocator => {
                ChainResponse::BlockLocator(state.locator_from(state.tip.hash))
            }
            ChainRequest::BlockLocatorFromHash(hash) => {
                ChainResponse::BlockLocator(state.locator_from(hash))
            }
            ChainRequest::IsCurrent => ChainResponse::IsCurrent(state.is_current),
        })
    }
}

impl Service<ChainRequest> for MockChain {
    type Response = ChainResponse;
    type Error = ChainError;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ChainRequest) -> Self::Future {
        ready(self.handle(req))
    }
}

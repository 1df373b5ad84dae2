use {
  super::{Block, BlockType, ChainError},
  crate::{
    clock::{LogicalTime, Shutdown, SimClock},
    consensus::Transaction,
  },
  std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
  },
  tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
  },
  tracing::{debug, warn},
};

/// Result of walking the chain from genesis and recomputing every
/// hash and merkle root.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IntegrityReport {
  pub ok: bool,
  pub errors: Vec<String>,
}

#[derive(Default)]
struct BatchQueue {
  txs: Vec<Transaction>,
  oldest: Option<LogicalTime>,
}

/// The primary store. The append lock covers only the in-memory
/// mutation; persistence is write-behind through a channel to a
/// dedicated writer task, so no disk I/O ever happens under the
/// lock.
pub struct BlockStore {
  chain: Mutex<Vec<Block>>,
  batch_size: usize,
  batch: Mutex<BatchQueue>,
  persist: Mutex<Option<UnboundedSender<Block>>>,
}

impl BlockStore {
  pub fn new(genesis_time: LogicalTime, batch_size: usize) -> Arc<Self> {
    Arc::new(Self {
      chain: Mutex::new(vec![Block::genesis(genesis_time)]),
      batch_size: batch_size.max(1),
      batch: Mutex::new(BatchQueue::default()),
      persist: Mutex::new(None),
    })
  }

  /// Enables write-behind persistence into `dir`, one canonical JSON
  /// file per block written atomically (temp file + rename). Returns
  /// the writer task handle; it drains and exits once
  /// [`BlockStore::close_persistence`] is called.
  pub fn enable_persistence(
    self: &Arc<Self>,
    dir: PathBuf,
  ) -> Result<JoinHandle<()>, ChainError> {
    std::fs::create_dir_all(&dir)?;
    let (tx, rx) = unbounded_channel();
    let genesis = self.chain.lock().unwrap()[0].clone();
    tx.send(genesis).expect("receiver alive");
    *self.persist.lock().unwrap() = Some(tx);
    Ok(tokio::spawn(persist_worker(dir, rx)))
  }

  /// Drops the writer channel so the writer task can finish the
  /// backlog and exit.
  pub fn close_persistence(&self) {
    self.persist.lock().unwrap().take();
  }

  fn push_block(
    &self,
    block_type: BlockType,
    transactions: Vec<Transaction>,
    now: LogicalTime,
  ) -> Block {
    let block = {
      let mut chain = self.chain.lock().unwrap();
      let tip = chain.last().expect("genesis always present");
      let block = Block::build(
        tip.block_number + 1,
        tip.block_hash,
        block_type,
        transactions,
        now,
      );
      chain.push(block.clone());
      block
    };
    // off the lock: hand the block to the writer
    if let Some(persist) = self.persist.lock().unwrap().as_ref() {
      let _ = persist.send(block.clone());
    }
    debug!("appended {block}");
    block
  }

  /// Accepts one committed transaction. With batching disabled every
  /// transaction becomes its own block; otherwise transactions queue
  /// until the batch fills (the flusher covers the timeout case).
  pub fn submit_committed(
    &self,
    tx: Transaction,
    now: LogicalTime,
  ) -> Option<Block> {
    if self.batch_size <= 1 {
      return Some(self.push_block(BlockType::Transaction, vec![tx], now));
    }
    let full = {
      let mut batch = self.batch.lock().unwrap();
      batch.oldest.get_or_insert(now);
      batch.txs.push(tx);
      batch.txs.len() >= self.batch_size
    };
    if full {
      self.flush_batch(now)
    } else {
      None
    }
  }

  /// Writes an attack verdict as its own block immediately,
  /// regardless of batching.
  pub fn append_verdict(&self, tx: Transaction, now: LogicalTime) -> Block {
    self.push_block(BlockType::AttackVerdict, vec![tx], now)
  }

  /// Flushes the pending batch into one batch block, if any.
  pub fn flush_batch(&self, now: LogicalTime) -> Option<Block> {
    let txs = {
      let mut batch = self.batch.lock().unwrap();
      if batch.txs.is_empty() {
        return None;
      }
      batch.oldest = None;
      std::mem::take(&mut batch.txs)
    };
    Some(self.push_block(BlockType::Batch, txs, now))
  }

  fn batch_oldest(&self) -> Option<LogicalTime> {
    self.batch.lock().unwrap().oldest
  }

  /// Background task that flushes a lingering partial batch once it
  /// exceeds the batch timeout.
  pub fn spawn_batch_flusher(
    self: &Arc<Self>,
    clock: Arc<SimClock>,
    timeout: Duration,
    shutdown: &Shutdown,
  ) -> JoinHandle<()> {
    let store = Arc::clone(self);
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
      let tick = clock.wall_duration(timeout) / 2;
      let tick = tick.max(Duration::from_millis(5));
      loop {
        tokio::select! {
          _ = tokio::time::sleep(tick) => {
            let now = clock.now();
            if let Some(oldest) = store.batch_oldest() {
              if now.since(oldest) >= timeout {
                store.flush_batch(now);
              }
            }
          }
          _ = shutdown.triggered() => {
            // final flush so nothing committed is lost
            store.flush_batch(clock.now());
            return;
          }
        }
      }
    })
  }

  pub fn height(&self) -> u64 {
    self.chain.lock().unwrap().last().unwrap().block_number
  }

  pub fn tip_hash(&self) -> super::BlockHash {
    self.chain.lock().unwrap().last().unwrap().block_hash
  }

  pub fn genesis(&self) -> Block {
    self.chain.lock().unwrap()[0].clone()
  }

  pub fn snapshot(&self) -> Vec<Block> {
    self.chain.lock().unwrap().clone()
  }

  /// Pure walk over the whole chain: linkage, header hashes and
  /// merkle roots. Never mutates, so repeated runs agree.
  pub fn verify_integrity(&self) -> IntegrityReport {
    let chain = self.chain.lock().unwrap().clone();
    let mut errors = Vec::new();
    for (i, block) in chain.iter().enumerate() {
      if block.block_number != i as u64 {
        errors.push(format!(
          "block {} stored at position {i}",
          block.block_number
        ));
      }
      if block.expected_hash() != block.block_hash {
        errors.push(format!("block {} header hash mismatch", block.block_number));
      }
      if block.expected_merkle_root() != block.merkle_root {
        errors.push(format!("block {} merkle root mismatch", block.block_number));
      }
      if i == 0 {
        if block.previous_hash != super::BlockHash::ZERO {
          errors.push("genesis previous hash is not zero".into());
        }
      } else if block.previous_hash != chain[i - 1].block_hash {
        errors.push(format!(
          "block {} does not link to block {}",
          block.block_number,
          i - 1
        ));
      }
    }
    IntegrityReport {
      ok: errors.is_empty(),
      errors,
    }
  }
}

/// Writes each block to `<dir>/<number>.json` via a temp file and an
/// atomic rename. Runs until the sender side is closed.
async fn persist_worker(dir: PathBuf, mut rx: UnboundedReceiver<Block>) {
  while let Some(block) = rx.recv().await {
    let path = dir.join(format!("{}.json", block.block_number));
    let tmp = dir.join(format!(".{}.json.tmp", block.block_number));
    let encoded = block.to_canonical_json();
    let result = async {
      tokio::fs::write(&tmp, encoded.as_bytes()).await?;
      tokio::fs::rename(&tmp, &path).await
    }
    .await;
    if let Err(error) = result {
      warn!("failed persisting block {}: {error}", block.block_number);
    }
  }
}

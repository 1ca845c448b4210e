//! In-memory model of the object directory lifecycle.
//!
//! Entries are append-only: destruction flips state and bumps the
//! generation but never frees the slot, and label lookup scans only the
//! header-pool prefix, exactly like the real `find_object`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Alive,
    Destroyed,
}

#[derive(Debug, Clone)]
pub struct EntryModel {
    pub label: String,
    pub state: EntryState,
    pub generation: u32,
}

/// Model of the directory plus the session sequence counter.
pub struct DirectoryModel {
    entries: Vec<EntryModel>,
    /// Entries with index below this are scanned by `find`.
    header_capacity: u32,
    pub sequence: u64,
}

impl DirectoryModel {
    pub fn new(header_capacity: u32) -> Self {
        Self {
            entries: Vec::new(),
            header_capacity,
            sequence: 0,
        }
    }

    /// Register a new entry; the slot index never changes afterwards.
    pub fn register(&mut self, label: &str) -> usize {
        self.entries.push(EntryModel {
            label: label.to_owned(),
            state: EntryState::Alive,
            generation: 1,
        });
        self.sequence += 1;
        self.entries.len() - 1
    }

    /// Destroy by slot index; destroying twice is a no-op.
    pub fn destroy(&mut self, index: usize) {
        let Some(entry) = self.entries.get_mut(index) else {
            return;
        };
        if entry.state == EntryState::Destroyed {
            return;
        }
        entry.state = EntryState::Destroyed;
        entry.generation += 1;
        self.sequence += 1;
    }

    /// First alive entry in the header prefix with this exact label.
    pub fn find(&self, label: &str) -> Option<usize> {
        self.entries
            .iter()
            .take(self.header_capacity as usize)
            .position(|e| e.state == EntryState::Alive && e.label == label)
    }

    /// Every alive entry, header and spill alike (the discovery scan).
    pub fn alive(&self) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state == EntryState::Alive)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn entries(&self) -> &[EntryModel] {
        &self.entries
    }

    /// Invariants that must hold after every operation.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (index, entry) in self.entries.iter().enumerate() {
            match (entry.state, entry.generation) {
                (EntryState::Alive, 1) | (EntryState::Destroyed, 2) => {}
                (state, generation) => {
                    return Err(format!(
                        "entry {index} has state {state:?} with generation {generation}"
                    ));
                }
            }
        }
        if self.sequence < self.entries.len() as u64 {
            return Err("sequence fell behind the registration count".to_owned());
        }
        Ok(())
    }
}

/// One fuzzed operation against the directory.
#[derive(Debug, Clone, Copy)]
pub enum DirectoryOp {
    Register { label: u8 },
    Destroy { index: u8 },
    Find { label: u8 },
}

fn label_for(byte: u8) -> String {
    format!("obj-{}", byte % 16)
}

/// Run an operation sequence and verify every invariant after each step.
pub fn execute_and_verify(header_capacity: u32, ops: &[DirectoryOp]) -> Result<(), String> {
    let header_capacity = header_capacity % 16 + 1;
    let mut model = DirectoryModel::new(header_capacity);

    for op in ops {
        let sequence_before = model.sequence;
        let count_before = model.entries().len();

        match *op {
            DirectoryOp::Register { label } => {
                let index = model.register(&label_for(label));
                if index != count_before {
                    return Err("registration reused a slot".to_owned());
                }
                if model.sequence <= sequence_before {
                    return Err("registration did not move the sequence".to_owned());
                }
            }
            DirectoryOp::Destroy { index } => {
                let index = index as usize % (model.entries().len().max(1));
                let was_alive = model
                    .entries()
                    .get(index)
                    .map(|e| e.state == EntryState::Alive)
                    .unwrap_or(false);
                model.destroy(index);
                if was_alive && model.sequence <= sequence_before {
                    return Err("destruction did not move the sequence".to_owned());
                }
                if !was_alive && model.sequence != sequence_before {
                    return Err("destroying a dead entry must not publish".to_owned());
                }
            }
            DirectoryOp::Find { label } => {
                let label = label_for(label);
                if let Some(found) = model.find(&label) {
                    let entry = &model.entries()[found];
                    if entry.state != EntryState::Alive || entry.label != label {
                        return Err("find returned a dead or mislabelled entry".to_owned());
                    }
                    let earlier = model.entries()[..found]
                        .iter()
                        .any(|e| e.state == EntryState::Alive && e.label == label);
                    if earlier {
                        return Err("find skipped an earlier alive match".to_owned());
                    }
                }
            }
        }

        if model.entries().len() < count_before {
            return Err("directory shrank".to_owned());
        }
        for index in model.alive() {
            if model.entries()[index].state != EntryState::Alive {
                return Err("alive scan returned a destroyed entry".to_owned());
            }
        }

        model.check_invariants()?;
    }
    Ok(())
}
